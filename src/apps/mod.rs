//! Application services of the instrument.
//!
//! - [`charger`]: battery charger control and interrupt handling
//! - [`eez_dib`]: SPI bridge to the EEZ-DIB companion board
//! - [`system`]: boot supervisor, status indicators and central error sink
//!
//! [`sstream`] and [`status_link`] are the boundaries to the sample-stream pipeline and
//! the operator status channel.

pub mod charger;
pub mod eez_dib;
pub mod sstream;
pub mod status_link;
pub mod system;
