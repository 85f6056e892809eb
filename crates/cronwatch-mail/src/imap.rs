//! IMAP mailbox — finds confirmation messages by subject and date.
//!
//! Each lookup opens a fresh TLS session, examines the mailbox read-only and
//! fetches with `BODY.PEEK[]` so nothing is marked as seen.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cronwatch_core::config::MailboxConfig;
use cronwatch_core::error::{CronWatchError, Result};
use cronwatch_core::traits::Mailbox;
use cronwatch_core::types::CandidateMessage;
use regex::Regex;

use crate::extract::{compile_regex, parse_delimited};

type ImapTlsStream = async_imap::Client<tokio_native_tls::TlsStream<tokio::net::TcpStream>>;

/// How a subject pattern is matched.
#[derive(Debug, Clone)]
pub enum SubjectCriterion {
    /// Case-insensitive substring, searched server-side.
    Literal(String),
    /// `/regex/flags`, applied locally to a date-bounded search.
    Pattern(Regex),
}

impl SubjectCriterion {
    pub fn parse(subject_pattern: &str) -> Result<Self> {
        if parse_delimited(subject_pattern).is_some() {
            let re = compile_regex(subject_pattern).map_err(|e| {
                CronWatchError::Config(format!("Invalid subject pattern '{subject_pattern}': {e}"))
            })?;
            return Ok(Self::Pattern(re));
        }
        Ok(Self::Literal(subject_pattern.to_string()))
    }

    pub fn matches(&self, subject: &str) -> bool {
        match self {
            Self::Literal(text) => subject.to_lowercase().contains(&text.to_lowercase()),
            Self::Pattern(re) => re.is_match(subject),
        }
    }

    /// IMAP SEARCH criteria for this subject and start date.
    pub fn search_query(&self, since: DateTime<Utc>) -> String {
        let date = since.format("%d-%b-%Y");
        match self {
            Self::Literal(text) => format!("SINCE {date} SUBJECT {}", quote(text)),
            Self::Pattern(_) => format!("SINCE {date}"),
        }
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Mailbox backed by an IMAP server.
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<ImapTlsStream> {
        let host = self.config.host.as_str();
        let tcp = tokio::net::TcpStream::connect((host, self.config.port))
            .await
            .map_err(|e| CronWatchError::MailboxUnavailable(format!("TCP connect: {e}")))?;

        let connector = native_tls::TlsConnector::new()
            .map_err(|e| CronWatchError::MailboxUnavailable(format!("TLS connector: {e}")))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tls_stream = connector
            .connect(host, tcp)
            .await
            .map_err(|e| CronWatchError::MailboxUnavailable(format!("TLS handshake: {e}")))?;

        Ok(async_imap::Client::new(tls_stream))
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn find_messages(
        &self,
        subject_pattern: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CandidateMessage>> {
        use futures::StreamExt;

        let criterion = SubjectCriterion::parse(subject_pattern)?;
        let client = self.connect().await?;
        let mut session = client
            .login(&self.config.user, &self.config.password)
            .await
            .map_err(|e| CronWatchError::MailboxUnavailable(format!("IMAP login: {}", e.0)))?;

        session
            .examine(&self.config.mailbox)
            .await
            .map_err(|e| CronWatchError::MailboxUnavailable(format!("Examine: {e}")))?;

        let query = criterion.search_query(since);
        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| CronWatchError::MailboxUnavailable(format!("Search: {e}")))?;

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        if uids.len() > self.config.max_fetch {
            // keep the newest
            uids.drain(..uids.len() - self.config.max_fetch);
        }

        if uids.is_empty() {
            session.logout().await.ok();
            tracing::debug!("📭 No messages for '{subject_pattern}' since {since}");
            return Ok(vec![]);
        }

        let uid_set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut fetches = session
            .uid_fetch(&uid_set, "(UID INTERNALDATE BODY.PEEK[])")
            .await
            .map_err(|e| CronWatchError::MailboxUnavailable(format!("Fetch: {e}")))?;

        let mut found = Vec::new();
        while let Some(fetch) = fetches.next().await {
            let fetch =
                fetch.map_err(|e| CronWatchError::MailboxUnavailable(format!("Fetch msg: {e}")))?;
            let internal_date = fetch.internal_date().map(|d| d.with_timezone(&Utc));
            let Some(raw) = fetch.body() else { continue };
            let Some(message) = parse_message(raw, fetch.uid.unwrap_or(0), internal_date) else {
                continue;
            };
            // SINCE is day-granular and SUBJECT is server-defined; re-check both.
            if message.received_at >= since && criterion.matches(&message.subject) {
                found.push(message);
            }
        }

        drop(fetches);
        session.logout().await.ok();
        tracing::info!("📧 {} candidate(s) for '{subject_pattern}'", found.len());
        Ok(found)
    }

    fn name(&self) -> &str {
        "imap"
    }
}

/// Parse raw RFC 822 bytes into a candidate message.
pub fn parse_message(
    raw: &[u8],
    uid: u32,
    internal_date: Option<DateTime<Utc>>,
) -> Option<CandidateMessage> {
    use mail_parser::MessageParser;
    let parsed = MessageParser::default().parse(raw)?;

    let mut headers = std::collections::BTreeMap::<String, String>::new();
    for (name, value) in parsed.headers_raw() {
        let name = name.to_ascii_lowercase();
        let value = value.trim();
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let html_body = parsed.body_html(0).map(|h| h.to_string());
    let body = parsed
        .body_text(0)
        .map(|s| s.to_string())
        .unwrap_or_else(|| html_body.as_deref().map(strip_html).unwrap_or_default());

    let received_at = internal_date
        .or_else(|| {
            parsed
                .date()
                .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        })
        .unwrap_or_else(Utc::now);

    Some(CandidateMessage {
        message_id: parsed
            .message_id()
            .map(String::from)
            .unwrap_or_else(|| format!("uid:{uid}")),
        subject: parsed.subject().unwrap_or_default().to_string(),
        body,
        html_body,
        from: headers.get("from").cloned().unwrap_or_default(),
        to: headers.get("to").cloned().unwrap_or_default(),
        headers,
        received_at,
    })
}

fn strip_html(html: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}
