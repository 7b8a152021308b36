mod api;
mod comments;
mod error;
mod extensions;
mod mention;
mod node;
mod plugin;
mod rows;
mod schema;
mod state;
mod track;
mod transform;
mod value;

pub use crate::api::*;
pub use crate::comments::*;
pub use crate::error::*;
pub use crate::extensions::*;
pub use crate::mention::*;
pub use crate::node::*;
pub use crate::plugin::*;
pub use crate::rows::*;
pub use crate::schema::*;
pub use crate::state::*;
pub use crate::track::*;
pub use crate::transform::*;
pub use crate::value::*;
