//! SMTP client with STARTTLS and AUTH support.
//!
//! The client exposes one method per protocol command and leaves sequencing
//! and timeouts to the caller:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use courier_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client =
//!     SmtpClient::connect("mx.example.com:25", "mx.example.com", Duration::from_secs(30)).await?;
//! client.read_greeting().await?;
//! let extensions = client.ehlo("localhost").await?.extensions();
//! if extensions.supports("STARTTLS") {
//!     client.starttls().await?;
//!     client.ehlo("localhost").await?;
//! }
//! client.mail_from("sender@example.com", &[]).await?;
//! client.rcpt_to("recipient@example.com").await?;
//! client.data().await?;
//! client.send_data(b"Subject: hi\r\n\r\nhello").await?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod error;
mod extensions;
mod response;
mod smtp_client;

pub use auth::{Mechanism, is_local_host};
pub use error::{ClientError, Result};
pub use extensions::Extensions;
pub use response::{Response, ResponseLine};
pub use smtp_client::{SmtpClient, encode_data};
