// Domain-layer modules and shared errors/models
pub mod state_machine {
    pub use crate::state_machine::*;
}

pub mod ledger {
    pub use crate::ledger::*;
}

pub mod verification {
    pub use crate::verification::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
