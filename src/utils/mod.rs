mod string;

pub use string::{truncate_at_boundary, truncate_with_marker};
