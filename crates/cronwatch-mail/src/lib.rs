//! # CronWatch Mail
//!
//! Everything that touches email:
//! - [`imap::ImapMailbox`] finds confirmation messages over async IMAP
//! - [`smtp::EmailNotifier`] delivers alerts over async SMTP
//! - [`extract`] turns a candidate message into structured evidence

pub mod extract;
pub mod imap;
pub mod smtp;

pub use extract::{evaluate, extract, select_candidate};
pub use imap::ImapMailbox;
pub use smtp::EmailNotifier;
