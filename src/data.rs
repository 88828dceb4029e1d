use std::any::Any;
use std::fmt;

/// An immutable payload that can be passed between tasks through events.
///
/// Data blocks are registered in the directory like any other object, events
/// and dependency slots only ever carry their guid.
pub struct DataBlock {
    value: Box<dyn Any + Send + Sync>,
}

impl DataBlock {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        DataBlock { value: Box::new(value) }
    }

    /// Typed access to the payload, `None` if it holds another type.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }
}

impl fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DataBlock").finish_non_exhaustive()
    }
}

#[test]
fn typed_access() {
    let block = DataBlock::new(vec![1u8, 2, 3]);
    assert!(block.is::<Vec<u8>>());
    assert_eq!(block.get::<Vec<u8>>(), Some(&vec![1, 2, 3]));
    assert_eq!(block.get::<u32>(), None);
}
