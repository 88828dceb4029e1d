pub use std::sync::atomic::Ordering;

#[cfg(not(loom))] pub use std::{
    sync::{
        Arc, Mutex, Condvar, RwLock,
        atomic::{AtomicI64, AtomicU8, AtomicU32, AtomicU64, AtomicBool, AtomicPtr, fence},
    },
    thread,
};


#[cfg(loom)] pub use loom::{
    sync::{
        Arc, Mutex, Condvar, RwLock,
        atomic::{AtomicI64, AtomicU8, AtomicU32, AtomicU64, AtomicBool, AtomicPtr, fence},
    },
    thread
};
