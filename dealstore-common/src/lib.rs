pub mod backend;
pub mod handle;
pub mod layout;

pub use backend::{Backend, ListFn, ObjectReader};
pub use handle::{FileInfo, Handle, ObjectType};
pub use layout::Layout;
