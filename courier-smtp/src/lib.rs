//! The SMTP client half of courier: just enough of RFC 5321 (plus STARTTLS
//! and AUTH) to hand one message to one server.

pub mod client;

pub use client::{ClientError, Extensions, Mechanism, Response, SmtpClient};
