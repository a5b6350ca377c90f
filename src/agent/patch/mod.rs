mod rebind;

pub use rebind::RebindPass;

use crate::agent::code::{CodeVersion, CompiledBody, InstantiationId, MethodToken, ModuleKey};
use crate::agent::error::Error;
use crate::agent::lock::InnerLockToken;
use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, info};
use std::sync::Mutex;
use strum_macros::{Display, IntoStaticStr};

/// What a patch does when execution reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum PatchKind {
    /// User breakpoint.
    Breakpoint,
    /// Single-step marker placed by a stepping operation.
    Stepper,
    /// Edit-and-Continue trap on an old code version, remap not yet taken.
    EncRemapPending,
    /// Marker left at the landing point after an accepted remap.
    EncRemapComplete,
}

/// Where a patch lives: a source (IL) offset that still needs mapping, or a
/// machine offset inside one concrete compiled body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchLocation {
    Il(u32),
    Native(u64),
}

impl PatchLocation {
    pub fn is_il(&self) -> bool {
        matches!(self, PatchLocation::Il(_))
    }
}

/// Lifecycle role of a patch.
///
/// A Master is a template for generic code and is never itself installed;
/// every code-visible patch is Bound or a Slave cloned from its Master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchRole {
    /// Created but not yet attached to any compiled body.
    Unbound,
    /// Template applicable to every instantiation of generic code.
    Master,
    /// Concrete clone of a Master, bound to one instantiation's body.
    Slave { master: u32 },
    /// Plain patch attached to a compiled body.
    Bound,
}

/// An entry in the patch table.
#[derive(Debug, Clone)]
pub struct Patch {
    number: u32,
    pub module: ModuleKey,
    pub method: MethodToken,
    pub location: PatchLocation,
    pub kind: PatchKind,
    /// The code version this patch was created against.
    pub version: CodeVersion,
    /// Restricts binding to one generic instantiation.
    pub instantiation_filter: Option<InstantiationId>,
    role: PatchRole,
    /// Version the patch is currently installed in, once code-visible.
    bound_version: Option<CodeVersion>,
    /// Machine location of the installed patch.
    native_address: Option<u64>,
}

impl Patch {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn role(&self) -> PatchRole {
        self.role
    }

    pub fn is_installed(&self) -> bool {
        self.native_address.is_some()
    }
}

/// Peer-supplied description of a patch to create.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRequest {
    pub module: ModuleKey,
    pub method: MethodToken,
    pub location: PatchLocation,
    pub kind: PatchKind,
    /// `None` applies the patch to the method's current (or first) version.
    pub version: Option<CodeVersion>,
    pub instantiation_filter: Option<InstantiationId>,
    /// Create a Master template covering every generic instantiation.
    pub all_instantiations: bool,
}

/// Patch information struct.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchView {
    pub number: u32,
    pub module: ModuleKey,
    pub method: MethodToken,
    pub location: PatchLocation,
    pub kind: PatchKind,
    pub version: CodeVersion,
    pub role: PatchRole,
    pub bound_version: Option<CodeVersion>,
    pub native_address: Option<u64>,
}

impl From<&Patch> for PatchView {
    fn from(p: &Patch) -> Self {
        Self {
            number: p.number,
            module: p.module,
            method: p.method,
            location: p.location,
            kind: p.kind,
            version: p.version,
            role: p.role,
            bound_version: p.bound_version,
            native_address: p.native_address,
        }
    }
}

pub(crate) struct TableCore {
    patches: IndexMap<u32, Patch>,
    next_number: u32,
}

impl TableCore {
    fn duplicate_exists(
        &self,
        module: ModuleKey,
        method: MethodToken,
        version: CodeVersion,
        location: PatchLocation,
    ) -> bool {
        self.patches.values().any(|p| {
            p.module == module && p.method == method && p.version == version && p.location == location
        })
    }

    fn bound_at(
        &self,
        module: ModuleKey,
        method: MethodToken,
        version: CodeVersion,
        location: PatchLocation,
        instantiation: Option<InstantiationId>,
    ) -> bool {
        self.patches.values().any(|p| {
            p.module == module
                && p.method == method
                && p.bound_version == Some(version)
                && p.location == location
                && p.instantiation_filter == instantiation
        })
    }

    fn insert(&mut self, mut patch: Patch) -> u32 {
        let number = self.next_number;
        self.next_number += 1;
        patch.number = number;
        self.patches.insert(number, patch);
        number
    }
}

/// Version-aware container for every patch the engine tracks, keyed by a
/// stable numeric handle. Its internal lock is strictly inner to the agent
/// lock and is only held across short table mutations, never across a
/// suspension or a command round-trip.
pub struct PatchTable {
    core: Mutex<TableCore>,
}

impl Default for PatchTable {
    fn default() -> Self {
        Self {
            core: Mutex::new(TableCore {
                patches: IndexMap::new(),
                next_number: 1,
            }),
        }
    }
}

impl PatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a patch. Two patches with identical
    /// `(module, method, version, location)` are forbidden.
    ///
    /// # Arguments
    ///
    /// * `req`: peer- or engine-supplied patch description
    /// * `default_version`: version applied when the request names none
    pub fn add(&self, req: PatchRequest, default_version: CodeVersion) -> Result<u32, Error> {
        let _token = InnerLockToken::new();
        let mut core = self.core.lock().expect("patch table poisoned");

        let version = req.version.unwrap_or(default_version);
        if core.duplicate_exists(req.module, req.method, version, req.location) {
            return Err(Error::DuplicatePatch {
                module: req.module,
                method: req.method,
                version,
            });
        }

        let role = if req.all_instantiations && req.instantiation_filter.is_none() {
            PatchRole::Master
        } else {
            PatchRole::Unbound
        };
        let number = core.insert(Patch {
            number: 0,
            module: req.module,
            method: req.method,
            location: req.location,
            kind: req.kind,
            version,
            instantiation_filter: req.instantiation_filter,
            role,
            bound_version: None,
            native_address: None,
        });
        debug!(
            target: "patch",
            "patch {number} added: {} at {}:{} {version}",
            req.kind, req.module, req.method,
        );
        Ok(number)
    }

    /// Remove a patch by handle. Removing a Master also drops its Slaves.
    pub fn remove(&self, number: u32) -> Result<PatchView, Error> {
        let _token = InnerLockToken::new();
        let mut core = self.core.lock().expect("patch table poisoned");

        let patch = core
            .patches
            .shift_remove(&number)
            .ok_or(Error::UnknownPatchHandle(number))?;
        if patch.role == PatchRole::Master {
            core.patches
                .retain(|_, p| p.role != (PatchRole::Slave { master: number }));
        }
        debug!(target: "patch", "patch {number} removed");
        Ok(PatchView::from(&patch))
    }

    pub fn get(&self, number: u32) -> Option<PatchView> {
        let _token = InnerLockToken::new();
        let core = self.core.lock().expect("patch table poisoned");
        core.patches.get(&number).map(PatchView::from)
    }

    pub fn find_all_for_method(&self, module: ModuleKey, method: MethodToken) -> Vec<PatchView> {
        let _token = InnerLockToken::new();
        let core = self.core.lock().expect("patch table poisoned");
        core.patches
            .values()
            .filter(|p| p.module == module && p.method == method)
            .map(PatchView::from)
            .collect()
    }

    /// Every patch, ordered by handle.
    pub fn list(&self) -> Vec<PatchView> {
        let _token = InnerLockToken::new();
        let core = self.core.lock().expect("patch table poisoned");
        core.patches
            .values()
            .map(PatchView::from)
            .sorted_by_key(|v| v.number)
            .collect()
    }

    /// Drop every patch of an unloaded module.
    pub fn remove_module(&self, module: ModuleKey) -> usize {
        let _token = InnerLockToken::new();
        let mut core = self.core.lock().expect("patch table poisoned");
        let before = core.patches.len();
        core.patches.retain(|_, p| p.module != module);
        let removed = before - core.patches.len();
        if removed != 0 {
            info!(target: "patch", "{removed} patches removed with {module}");
        }
        removed
    }

    /// Drop everything. Used by detach.
    pub fn clear(&self) -> usize {
        let _token = InnerLockToken::new();
        let mut core = self.core.lock().expect("patch table poisoned");
        let removed = core.patches.len();
        core.patches.clear();
        if removed != 0 {
            info!(target: "patch", "patch table cleared, {removed} patches dropped");
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        let _token = InnerLockToken::new();
        self.core.lock().expect("patch table poisoned").patches.is_empty()
    }

    /// Insert Edit-and-Continue remap traps at every stack-empty, non-handler
    /// sequence point of an old code version. Idempotent per location thanks
    /// to the duplicate guard.
    pub fn seed_enc_remap(
        &self,
        module: ModuleKey,
        method: MethodToken,
        old_body: &CompiledBody,
    ) -> Vec<u32> {
        let _token = InnerLockToken::new();
        let mut core = self.core.lock().expect("patch table poisoned");

        let mut seeded = vec![];
        for sp in old_body
            .sequence_points
            .iter()
            .filter(|sp| sp.stack_empty && !sp.in_handler)
        {
            let location = PatchLocation::Il(sp.il_offset);
            let already_seeded = core.patches.values().any(|p| {
                p.module == module
                    && p.method == method
                    && p.version == old_body.version
                    && p.location == location
                    && p.instantiation_filter == old_body.instantiation
            });
            if already_seeded {
                continue;
            }
            let number = core.insert(Patch {
                number: 0,
                module,
                method,
                location,
                kind: PatchKind::EncRemapPending,
                version: old_body.version,
                instantiation_filter: old_body.instantiation,
                role: PatchRole::Bound,
                bound_version: Some(old_body.version),
                native_address: Some(sp.native_offset),
            });
            seeded.push(number);
        }
        if !seeded.is_empty() {
            info!(
                target: "patch",
                "{} remap traps seeded on {module}:{method} {}",
                seeded.len(),
                old_body.version,
            );
        }
        seeded
    }

    /// Turn an accepted remap trap into a completion marker at the landing
    /// sequence point of the new version.
    pub fn complete_remap(
        &self,
        number: u32,
        new_version: CodeVersion,
        landing_il: u32,
        landing_native: u64,
    ) -> Result<(), Error> {
        let _token = InnerLockToken::new();
        let mut core = self.core.lock().expect("patch table poisoned");

        let patch = core
            .patches
            .get_mut(&number)
            .ok_or(Error::UnknownPatchHandle(number))?;
        if patch.kind != PatchKind::EncRemapPending {
            return Err(Error::UnknownPatchHandle(number));
        }
        patch.kind = PatchKind::EncRemapComplete;
        patch.version = new_version;
        patch.bound_version = Some(new_version);
        patch.location = PatchLocation::Il(landing_il);
        patch.native_address = Some(landing_native);
        info!(target: "patch", "patch {number} remapped to {new_version} at il {landing_il}");
        Ok(())
    }
}
