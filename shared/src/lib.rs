pub mod bot;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use bot::*;
pub use config::*;
pub use protocol::*;
pub use transport::*;

// カテゴリ別ログマクロの展開先で使う
#[doc(hidden)]
pub use paste;
