mod machine;

pub use machine::{ProvisionError, ProvisionOutcome, ProvisionState, ProvisioningMachine};
