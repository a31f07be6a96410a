//! Entity states, wrapper objects and entity-set states.

mod object;
mod set;
mod state;

pub use object::{EntityObject, Persistent, StructureObject};
pub use set::EntitySetState;
pub use state::{EntityState, PersistenceState};
