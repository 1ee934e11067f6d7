//! Control-block registry
//!
//! The driver's state hangs off four kinds of blocks:
//!
//! ```text
//! DCB (disk device) --> VCB (mounted volume) --> FCB (open path) <-- CCB (open handle)
//! ```
//!
//! Opaque slots (device extensions, `FsContext2`) hold a [`ControlBlock`],
//! a closed enum over the four kinds. Getting a concrete block out of it is
//! always a checked downcast: a slot holding the wrong kind is a malformed
//! request (`STATUS_INVALID_PARAMETER`), never a fault.
//!
//! Ownership points down the hierarchy. Links back up (FCB to VCB, VCB to
//! DCB) are weak [`BlockRef`]s, so a torn-down parent shows up as a missing
//! link rather than being kept alive by its children.

pub mod ccb;
pub mod dcb;
pub mod fcb;
pub mod oplock_debug;
pub mod vcb;

pub use ccb::Ccb;
pub use dcb::Dcb;
pub use fcb::Fcb;
pub use oplock_debug::{OplockDebugEvent, OplockDebugInfo, OplockDebugRecord};
pub use vcb::Vcb;

use alloc::sync::{Arc, Weak};
use core::fmt;

use crate::io::file::FileObject;
use crate::status::NtStatus;

const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

/// Node type codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Dcb = fourcc(b":DCB"),
    Vcb = fourcc(b":VCB"),
    Fcb = fourcc(b":FCB"),
    Ccb = fourcc(b":CCB"),
}

impl NodeType {
    pub const fn name(self) -> &'static str {
        match self {
            NodeType::Dcb => "DCB",
            NodeType::Vcb => "VCB",
            NodeType::Fcb => "FCB",
            NodeType::Ccb => "CCB",
        }
    }
}

/// Type tag and size carried by every block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentifier {
    pub node_type: NodeType,
    pub node_size: u32,
}

impl NodeIdentifier {
    pub const fn of<T>(node_type: NodeType) -> Self {
        Self {
            node_type,
            node_size: core::mem::size_of::<T>() as u32,
        }
    }
}

/// A block stored in an opaque slot
#[derive(Clone)]
pub enum ControlBlock {
    Dcb(Arc<Dcb>),
    Vcb(Arc<Vcb>),
    Fcb(Arc<Fcb>),
    Ccb(Arc<Ccb>),
}

impl ControlBlock {
    pub fn identifier(&self) -> NodeIdentifier {
        match self {
            ControlBlock::Dcb(dcb) => dcb.identifier(),
            ControlBlock::Vcb(vcb) => vcb.identifier(),
            ControlBlock::Fcb(fcb) => fcb.identifier(),
            ControlBlock::Ccb(ccb) => ccb.identifier(),
        }
    }

    #[inline]
    pub fn node_type(&self) -> NodeType {
        self.identifier().node_type
    }

    fn mismatch<T>(&self, expected: NodeType) -> Result<T, NtStatus> {
        log::debug!(
            "[BLOCK] expected {} but found {}",
            expected.name(),
            self.node_type().name()
        );
        Err(NtStatus::InvalidParameter)
    }

    pub fn as_dcb(&self) -> Result<Arc<Dcb>, NtStatus> {
        match self {
            ControlBlock::Dcb(dcb) => Ok(Arc::clone(dcb)),
            _ => self.mismatch(NodeType::Dcb),
        }
    }

    pub fn as_vcb(&self) -> Result<Arc<Vcb>, NtStatus> {
        match self {
            ControlBlock::Vcb(vcb) => Ok(Arc::clone(vcb)),
            _ => self.mismatch(NodeType::Vcb),
        }
    }

    pub fn as_fcb(&self) -> Result<Arc<Fcb>, NtStatus> {
        match self {
            ControlBlock::Fcb(fcb) => Ok(Arc::clone(fcb)),
            _ => self.mismatch(NodeType::Fcb),
        }
    }

    pub fn as_ccb(&self) -> Result<Arc<Ccb>, NtStatus> {
        match self {
            ControlBlock::Ccb(ccb) => Ok(Arc::clone(ccb)),
            _ => self.mismatch(NodeType::Ccb),
        }
    }

    pub fn downgrade(&self) -> BlockRef {
        match self {
            ControlBlock::Dcb(dcb) => BlockRef::Dcb(Arc::downgrade(dcb)),
            ControlBlock::Vcb(vcb) => BlockRef::Vcb(Arc::downgrade(vcb)),
            ControlBlock::Fcb(fcb) => BlockRef::Fcb(Arc::downgrade(fcb)),
            ControlBlock::Ccb(ccb) => BlockRef::Ccb(Arc::downgrade(ccb)),
        }
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identifier = self.identifier();
        write!(f, "{}({} bytes)", identifier.node_type.name(), identifier.node_size)
    }
}

/// Weak link to a parent block
#[derive(Clone, Default)]
pub enum BlockRef {
    #[default]
    Empty,
    Dcb(Weak<Dcb>),
    Vcb(Weak<Vcb>),
    Fcb(Weak<Fcb>),
    Ccb(Weak<Ccb>),
}

impl BlockRef {
    /// The linked block, if it is still alive
    pub fn upgrade(&self) -> Option<ControlBlock> {
        match self {
            BlockRef::Empty => None,
            BlockRef::Dcb(dcb) => dcb.upgrade().map(ControlBlock::Dcb),
            BlockRef::Vcb(vcb) => vcb.upgrade().map(ControlBlock::Vcb),
            BlockRef::Fcb(fcb) => fcb.upgrade().map(ControlBlock::Fcb),
            BlockRef::Ccb(ccb) => ccb.upgrade().map(ControlBlock::Ccb),
        }
    }

    /// Upgrade and downcast; a dead or mistyped link is invalid-parameter
    pub(crate) fn resolve<T>(
        &self,
        what: NodeType,
        downcast: impl FnOnce(&ControlBlock) -> Result<Arc<T>, NtStatus>,
    ) -> Result<Arc<T>, NtStatus> {
        match self.upgrade() {
            Some(block) => downcast(&block),
            None => {
                log::debug!("[BLOCK] missing {} link", what.name());
                Err(NtStatus::InvalidParameter)
            }
        }
    }
}

impl From<&Arc<Dcb>> for BlockRef {
    fn from(dcb: &Arc<Dcb>) -> Self {
        BlockRef::Dcb(Arc::downgrade(dcb))
    }
}

impl From<&Arc<Vcb>> for BlockRef {
    fn from(vcb: &Arc<Vcb>) -> Self {
        BlockRef::Vcb(Arc::downgrade(vcb))
    }
}

/// A handle resolved all the way up to its device
#[derive(Clone)]
pub struct Resolved {
    pub ccb: Arc<Ccb>,
    pub fcb: Arc<Fcb>,
    pub vcb: Arc<Vcb>,
    pub dcb: Arc<Dcb>,
}

/// The CCB stored in a file object
pub fn resolve_ccb(file_object: Option<&FileObject>) -> Result<Arc<Ccb>, NtStatus> {
    let file_object = file_object.ok_or_else(|| {
        log::debug!("[BLOCK] no file object");
        NtStatus::InvalidParameter
    })?;
    match &file_object.fs_context2 {
        Some(block) => block.as_ccb(),
        None => {
            log::debug!("[BLOCK] file object {} has no CCB", file_object.id());
            Err(NtStatus::InvalidParameter)
        }
    }
}

/// Walk CCB -> FCB -> VCB -> DCB, validating each link
pub fn resolve(file_object: Option<&FileObject>) -> Result<Resolved, NtStatus> {
    let ccb = resolve_ccb(file_object)?;
    let fcb = ccb.fcb()?;
    let vcb = fcb.vcb()?;
    let dcb = vcb.dcb()?;
    Ok(Resolved { ccb, fcb, vcb, dcb })
}
