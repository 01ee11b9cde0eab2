//! Descriptor Module
//!
//! Virtual file descriptors, independent of the operating system's.
//!
//! ## Layout
//! ```text
//!  fd:      0   1   2   3   4   5  ...  capacity-1
//!  bitmap:  -   -   -   1   0   1  ...
//!  slots:   -   -   -  [F] [ ] [F] ...
//!          └ reserved ┘
//! ```
//! A bit is set iff its slot holds an entry.

mod bitmap;
mod table;

pub use bitmap::Bitmap;
pub use table::DescriptorTable;

/// A virtual file descriptor
pub type Fd = i32;
