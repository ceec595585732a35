pub use gangway_core as core;

pub use gangway_select as select;

#[cfg(feature = "tcp")]
pub use gangway_tcp as tcp;
