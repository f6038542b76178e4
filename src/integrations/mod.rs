//! External service integrations.

pub mod idm_client {
    pub use crate::idm_client::*;
}

pub mod onfido_client {
    pub use crate::onfido_client::*;
}

pub mod analytics_client {
    pub use crate::analytics_client::*;
}
