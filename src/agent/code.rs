use crate::agent::error::Error;
use crate::agent::lock::InnerLockToken;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Mutex;

/// Opaque identity of a loaded module, assigned by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey(pub u64);

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Metadata token of a method within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodToken(pub u32);

impl fmt::Display for MethodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{:#08x}", self.0)
    }
}

/// A distinct compiled body of a method, produced by the initial build or by
/// an Edit-and-Continue edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeVersion(pub u32);

impl CodeVersion {
    pub const INITIAL: CodeVersion = CodeVersion(1);

    pub fn next(self) -> CodeVersion {
        CodeVersion(self.0 + 1)
    }
}

impl fmt::Display for CodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One concrete instantiation of generic code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstantiationId(pub u32);

/// Handle of a host runtime execution thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadHandle(pub u64);

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Application-domain filter for a resume request. `None` resumes everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainKey(pub u32);

/// One source-to-machine mapping entry of a compiled body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePoint {
    pub il_offset: u32,
    pub native_offset: u64,
    /// The evaluation stack is empty at this point.
    pub stack_empty: bool,
    /// The point lies inside an exception handler region.
    pub in_handler: bool,
}

/// Everything the engine needs to know about one compiled body: its version,
/// the instantiation it was compiled for (generic code only) and its
/// sequence-point table as provided by the host's JIT-info service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledBody {
    pub version: CodeVersion,
    pub instantiation: Option<InstantiationId>,
    pub sequence_points: Vec<SequencePoint>,
}

/// Collaborator service: maps an IL offset of a method version to a machine
/// offset. `None` means the mapping is not available (not a sequence point,
/// version not compiled, or the versions are not mappable onto each other).
pub trait OffsetMapper: Send + Sync {
    fn resolve(
        &self,
        module: ModuleKey,
        method: MethodToken,
        version: CodeVersion,
        il_offset: u32,
    ) -> Option<u64>;
}

#[derive(Default)]
struct CodeTableCore {
    methods: IndexMap<(ModuleKey, MethodToken), Vec<CompiledBody>>,
    /// Versions handed out by apply-code-edit but not yet compiled.
    reserved: IndexMap<(ModuleKey, MethodToken), CodeVersion>,
}

/// Registry of compiled bodies per method, in publish order. This is the
/// engine-side mirror of the host's JIT-info tables, holding only what the
/// rebind and remap paths need.
#[derive(Default)]
pub struct CodeVersionTable {
    core: Mutex<CodeTableCore>,
}

impl CodeVersionTable {
    /// Record a freshly compiled body. Returns the bodies of every older
    /// version, the input for Edit-and-Continue remap-patch seeding.
    pub fn publish(
        &self,
        module: ModuleKey,
        method: MethodToken,
        body: &CompiledBody,
    ) -> Result<Vec<CompiledBody>, Error> {
        let _token = InnerLockToken::new();
        let mut core = self.core.lock().expect("code table poisoned");

        let bodies = core.methods.entry((module, method)).or_default();
        if bodies
            .iter()
            .any(|b| b.version == body.version && b.instantiation == body.instantiation)
        {
            return Err(Error::DuplicateCodeVersion {
                module,
                method,
                version: body.version,
            });
        }

        let older: Vec<CompiledBody> = bodies
            .iter()
            .filter(|b| b.version < body.version)
            .cloned()
            .collect();
        bodies.push(body.clone());

        if core.reserved.get(&(module, method)) == Some(&body.version) {
            core.reserved.shift_remove(&(module, method));
        }

        Ok(older)
    }

    /// Allocate the next version number for a method, for an incoming code
    /// edit. The compiled body for it arrives later via [`Self::publish`].
    pub fn reserve_next_version(&self, module: ModuleKey, method: MethodToken) -> CodeVersion {
        let _token = InnerLockToken::new();
        let mut core = self.core.lock().expect("code table poisoned");

        let published = core
            .methods
            .get(&(module, method))
            .and_then(|bodies| bodies.iter().map(|b| b.version).max())
            .unwrap_or(CodeVersion::INITIAL);
        let reserved = core.reserved.get(&(module, method)).copied();
        let next = reserved.unwrap_or(published).next();
        core.reserved.insert((module, method), next);
        next
    }

    /// Latest published version of a method, if any body exists.
    pub fn latest_version(&self, module: ModuleKey, method: MethodToken) -> Option<CodeVersion> {
        let _token = InnerLockToken::new();
        let core = self.core.lock().expect("code table poisoned");
        core.methods
            .get(&(module, method))
            .and_then(|bodies| bodies.iter().map(|b| b.version).max())
    }

    /// All published bodies of a method, in publish order.
    pub fn bodies(&self, module: ModuleKey, method: MethodToken) -> Vec<CompiledBody> {
        let _token = InnerLockToken::new();
        let core = self.core.lock().expect("code table poisoned");
        core.methods
            .get(&(module, method))
            .cloned()
            .unwrap_or_default()
    }

    /// Forget every body of an unloaded module.
    pub fn remove_module(&self, module: ModuleKey) -> usize {
        let _token = InnerLockToken::new();
        let mut core = self.core.lock().expect("code table poisoned");
        let before = core.methods.len();
        core.methods.retain(|(m, _), _| *m != module);
        core.reserved.retain(|(m, _), _| *m != module);
        before - core.methods.len()
    }
}
