//! # hsha-module: Default implementations
//!
//! One default implementation for every `hsha-core` trait, plus the
//! selector that produces frame units in the first place.
//!
//! ## Default stack
//!
//! | Trait / role    | Default Impl       | Notes                          |
//! |-----------------|--------------------|--------------------------------|
//! | WorkerPool      | ElasticPool        | min..max threads, SegQueue     |
//! | Notifier        | EventFdNotifier    | Linux eventfd                  |
//! | FrameUnit       | PendingFrame       | built by the selector          |
//! | (reactor)       | Selector           | epoll, length-prefixed frames  |

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub mod eventfd_notifier;
        pub mod selector;

        pub use eventfd_notifier::EventFdNotifier;
        pub use selector::{Selector, SelectorHandle};
    } else {
        compile_error!("hsha-module: the selector requires Linux epoll/eventfd");
    }
}

pub mod elastic_pool;
pub mod framed;

pub use elastic_pool::ElasticPool;
