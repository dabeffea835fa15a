//! Type definitions for keygate storage.

mod demo;
mod ids;
mod invitations;
mod licenses;
mod members;
mod organizations;
mod payments;
mod subscriptions;
mod tiers;
mod users;

// Re-export all types from submodules
pub use demo::*;
pub use ids::*;
pub use invitations::*;
pub use licenses::*;
pub use members::*;
pub use organizations::*;
pub use payments::*;
pub use subscriptions::*;
pub use tiers::*;
pub use users::*;
