//! Storage layer: packet codec, page bitmap and the page cache

pub mod bitmap;
pub mod cache;
pub mod checksum;
pub mod packet;
pub mod page_constants;
pub mod page_state;

pub use bitmap::PageBitmap;
pub use cache::PageCache;
pub use page_state::{BitmapStrategy, PageClass, PageState};
