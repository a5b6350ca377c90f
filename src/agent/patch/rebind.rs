use crate::agent::code::{CodeVersion, CompiledBody, MethodToken, ModuleKey, OffsetMapper};
use crate::agent::lock::InnerLockToken;
use crate::agent::patch::{Patch, PatchKind, PatchLocation, PatchRole, PatchTable, PatchView};
use log::debug;
use smallvec::SmallVec;
use std::collections::HashSet;

/// State of one rebind pass. A pass runs once per newly compiled or
/// recompiled body publication and may span several methods; its dedup set is
/// scoped to the pass as a whole, not to a single method.
#[derive(Default)]
pub struct RebindPass {
    bound: HashSet<(u32, CodeVersion)>,
}

impl RebindPass {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatchTable {
    /// Attach every applicable patch of a method to a freshly published body.
    ///
    /// For each candidate: skip if already bound to this version in this pass;
    /// skip Slaves (they are regenerated from their Master, never copied);
    /// skip patches whose instantiation filter doesn't match the new body;
    /// equal source and destination versions bind directly (cloning a fresh
    /// Slave from a Master, or binding a plain patch in place); a
    /// version-crossing bind goes through the offset mapper and reports
    /// through `could_not_bind` when the mapping is unavailable, without
    /// failing the rest of the pass.
    ///
    /// Returns the views of every patch that became code-visible.
    pub fn rebind_after_code_version(
        &self,
        pass: &mut RebindPass,
        module: ModuleKey,
        method: MethodToken,
        body: &CompiledBody,
        mapper: &dyn OffsetMapper,
        mut could_not_bind: impl FnMut(PatchView),
    ) -> Vec<PatchView> {
        let _token = InnerLockToken::new();
        let mut core = self.core.lock().expect("patch table poisoned");

        let candidates: SmallVec<[u32; 8]> = core
            .patches
            .values()
            .filter(|p| p.module == module && p.method == method)
            // unbound-but-applicable only: Slaves are regenerated from their
            // Master, Bound patches already live in code
            .filter(|p| matches!(p.role, PatchRole::Unbound | PatchRole::Master))
            // remap traps have their own lifecycle, seeding and redirect
            .filter(|p| {
                !matches!(
                    p.kind,
                    PatchKind::EncRemapPending | PatchKind::EncRemapComplete
                )
            })
            .filter(|p| {
                p.instantiation_filter.is_none() || p.instantiation_filter == body.instantiation
            })
            .map(|p| p.number)
            .collect();

        let mut newly_bound = vec![];
        for number in candidates {
            if pass.bound.contains(&(number, body.version)) {
                continue;
            }
            let patch = core.patches[&number].clone();
            if core.bound_at(module, method, body.version, patch.location, body.instantiation) {
                continue;
            }

            let native = match patch.location {
                PatchLocation::Native(addr) if patch.version == body.version => Some(addr),
                // machine offsets don't survive recompilation
                PatchLocation::Native(_) => None,
                PatchLocation::Il(il) => mapper.resolve(module, method, body.version, il),
            };
            let Some(native) = native else {
                debug!(
                    target: "patch",
                    "patch {number} could not bind to {module}:{method} {}",
                    body.version,
                );
                could_not_bind(PatchView::from(&patch));
                continue;
            };

            pass.bound.insert((number, body.version));
            let view = match patch.role {
                PatchRole::Master => {
                    let slave = core.insert(Patch {
                        number: 0,
                        module,
                        method,
                        location: patch.location,
                        kind: patch.kind,
                        version: patch.version,
                        instantiation_filter: body.instantiation,
                        role: PatchRole::Slave { master: number },
                        bound_version: Some(body.version),
                        native_address: Some(native),
                    });
                    PatchView::from(&core.patches[&slave])
                }
                _ => {
                    let p = core.patches.get_mut(&number).expect("present, cloned above");
                    p.role = PatchRole::Bound;
                    p.bound_version = Some(body.version);
                    p.native_address = Some(native);
                    PatchView::from(&*p)
                }
            };
            debug!(
                target: "patch",
                "patch {} bound to {module}:{method} {} at {native:#x}",
                view.number,
                body.version,
            );
            newly_bound.push(view);
        }
        newly_bound
    }
}
