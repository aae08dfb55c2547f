pub mod error;
pub mod profile;
pub mod reconcile;
pub mod routes;
pub mod snapshot;
pub mod system;
pub mod verify;
