//! filemailer: a Telegram bot and HTTP service that fetches linked files
//! and mails them to the submitter as attachments.
//!
//! The delivery pipeline and the e-mail change approval workflow are the
//! core; the Telegram and HTTP front-ends are thin callers.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;

pub mod auth;
pub mod joblog;
pub mod mail;
pub mod store;

pub mod approval;
pub mod pipeline;

pub mod http;
pub mod telegram;
