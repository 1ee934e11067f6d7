//! File objects
//!
//! A file object is the I/O manager's view of one open handle. The file
//! system stores its per-handle context block in `fs_context2`.

use alloc::sync::Arc;

use crate::blocks::ControlBlock;

#[derive(Debug)]
pub struct FileObject {
    id: u64,
    /// FsContext2: the CCB of this handle, if the file system set one
    pub fs_context2: Option<ControlBlock>,
}

impl FileObject {
    pub fn new(id: u64, fs_context2: Option<ControlBlock>) -> Arc<Self> {
        Arc::new(Self { id, fs_context2 })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}
