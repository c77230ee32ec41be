pub mod access_scanner;
pub mod defragmenter;
pub mod expiry_pager;
pub mod item_pager;
pub mod resizer;
