#![forbid(unsafe_code)]

mod frame;
mod pager;
mod space;

pub use frame::PageLatch;
pub use pager::{FetchMode, MemPager, PageStore, PagerStats};
pub use space::{ExtentReservation, FileSpace, ReserveClass, DEFAULT_EXTENT_PAGES};
