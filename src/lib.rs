//! # Rustmidea
//!
//! Asynchronous local and cloud control of Midea dehumidifiers and air
//! conditioners. Appliances are reached over their v3 LAN channel when
//! possible and through the vendor cloud relay otherwise.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rustmidea::{ApplianceClient, ApplianceFamily};
//!
//! # async fn run() -> rustmidea::error::Result<()> {
//! let client = ApplianceClient::builder(17592186063322, ApplianceFamily::Dehumidifier)
//!     .with_address("192.168.1.50".parse().unwrap())
//!     .with_token("APPLIANCE_TOKEN", "APPLIANCE_KEY")
//!     .build()?;
//! let state = client.query().await?;
//! println!("{:?}", state);
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod cloud;
pub mod command;
pub mod crypto;
pub mod device;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod scanner;

pub use cloud::{CloudConfig, CloudSession, Credentials};
pub use command::{ApplianceFamily, ApplianceState, Command};
pub use device::{ApplianceClient, ApplianceClientBuilder};
pub use error::MideaError;
pub use manager::{Auth, Manager, Target};
pub use scanner::{DiscoveryResult, Scanner};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
