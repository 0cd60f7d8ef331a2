mod driver;
mod memory;

pub use driver::{Reflection, Reflector};
pub use memory::ReflectionMemory;
