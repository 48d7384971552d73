//! Client side of the gateway.
//!
//! - [`ClientSession`]: one managed TCP connection with id-correlated
//!   request/response, timeouts, capped exponential backoff and a periodic
//!   health check, plus a UDP socket for streaming.
//! - [`StreamThrottle`]: rate and change-threshold limiting for continuous
//!   parameter streams sent over UDP.
//!
//! ```no_run
//! use stagelink_client::{ClientSession, ClientConfig};
//! use stagelink_client::types::params;
//!
//! # async fn demo() -> Result<(), stagelink_client::ClientError> {
//! let session = ClientSession::new(ClientConfig::default());
//! session.connect().await?;
//! let info = session.call("get_session_info", params! {}).await?;
//! println!("{:?}", info);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod session;
pub mod throttle;

pub use stagelink_types as types;

pub use config::{Backoff, ClientConfig, StreamConfig, StreamMode};
pub use error::{ClientError, Result};
pub use session::{ClientSession, ConnectionState, SessionStatus};
pub use throttle::{normalize, DatagramSink, StreamStats, StreamThrottle, MAX_AXES};
