//! Read-only views of a store for administration: folder summaries, block
//! listings, and an audit that re-checks every stored chain.

use std::time::SystemTime;

use tracing::{debug, warn};

use tlfmd_core::clock::from_unix_millis;
use tlfmd_core::{
    BranchId, CryptPublicKey, KeyGen, MdId, MergeStatus, RequestContext, Revision, RootMetadataSigned, TlfHandle,
    TlfId, UserId,
};

use crate::disk::MdServerDisk;
use crate::error::{ServerError, ServerResult};
use crate::memory::MdServerMemory;
use crate::state::{PersistedStore, StoredBlock};
use crate::validate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSummary {
    pub bid: BranchId,
    pub initial_revision: Revision,
    pub head_revision: Revision,
    pub blocks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSummary {
    pub id: TlfId,
    pub handle: Option<TlfHandle>,
    /// Merged history first, then unmerged branches by ID.
    pub branches: Vec<BranchSummary>,
    /// Active branch records: device key to branch.
    pub devices: Vec<(CryptPublicKey, BranchId)>,
}

/// One stored revision as the CLI lists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub revision: Revision,
    pub md_id: MdId,
    pub prev_root: MdId,
    pub server_time: SystemTime,
    pub merge_status: MergeStatus,
    pub last_modifying_user: UserId,
    pub key_gen: KeyGen,
}

impl BlockSummary {
    fn from_block(rmds: &RootMetadataSigned, block: &StoredBlock) -> ServerResult<Self> {
        Ok(Self {
            revision: rmds.revision(),
            md_id: rmds.md_id()?,
            prev_root: rmds.md.prev_root,
            server_time: from_unix_millis(block.timestamp_ms),
            merge_status: rmds.md.merge_status(),
            last_modifying_user: rmds.md.last_modifying_user.clone(),
            key_gen: rmds.md.latest_key_gen,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFinding {
    pub branch: BranchId,
    pub revision: Revision,
    pub problem: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub tlf: TlfId,
    pub blocks_checked: usize,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

fn sorted_branches(snapshot: &PersistedStore, tlf: TlfId) -> Vec<BranchId> {
    let mut bids: Vec<BranchId> = snapshot
        .state
        .md
        .get(&tlf)
        .map(|per_tlf| per_tlf.keys().copied().collect())
        .unwrap_or_default();
    // The null branch sorts first.
    bids.sort();
    bids
}

impl MdServerMemory {
    /// Every folder the store knows, by ID.
    pub async fn folders(&self) -> ServerResult<Vec<FolderSummary>> {
        let snapshot = self.snapshot().await?;
        let mut ids: Vec<TlfId> = snapshot
            .state
            .latest_handles
            .keys()
            .chain(snapshot.state.md.keys())
            .copied()
            .collect();
        ids.sort();
        ids.dedup();

        let folders = ids
            .into_iter()
            .map(|id| {
                let branches = sorted_branches(&snapshot, id)
                    .into_iter()
                    .filter_map(|bid| {
                        let list = snapshot.state.block_list(id, bid)?;
                        let blocks = list.blocks.len();
                        Some(BranchSummary {
                            bid,
                            initial_revision: list.initial_revision,
                            head_revision: list.initial_revision + (blocks as i64 - 1),
                            blocks,
                        })
                    })
                    .collect();
                let mut devices: Vec<(CryptPublicKey, BranchId)> = snapshot
                    .state
                    .branches
                    .get(&id)
                    .map(|per_tlf| per_tlf.iter().map(|(k, b)| (*k, *b)).collect())
                    .unwrap_or_default();
                devices.sort();
                FolderSummary {
                    id,
                    handle: snapshot.state.latest_handles.get(&id).cloned(),
                    branches,
                    devices,
                }
            })
            .collect();
        Ok(folders)
    }

    /// Stored revisions of (tlf, bid) in order.
    pub async fn list_blocks(&self, tlf: TlfId, bid: BranchId) -> ServerResult<Vec<BlockSummary>> {
        let snapshot = self.snapshot().await?;
        let list = snapshot
            .state
            .block_list(tlf, bid)
            .ok_or_else(|| ServerError::NotFound(format!("no revisions for folder {tlf} on branch {bid}")))?;
        list.blocks
            .iter()
            .map(|block| BlockSummary::from_block(&block.decode()?, block))
            .collect()
    }

    /// Decode and re-verify every stored block of `tlf`, and check each
    /// append against the block before it. Unmerged branches are also
    /// checked against the merged revision they fork from.
    pub async fn audit(&self, ctx: &RequestContext, tlf: TlfId) -> ServerResult<AuditReport> {
        let snapshot = self.snapshot().await?;
        let bids = sorted_branches(&snapshot, tlf);
        if bids.is_empty() {
            return Err(ServerError::NotFound(format!("no revisions for folder {tlf}")));
        }

        let mut report = AuditReport {
            tlf,
            blocks_checked: 0,
            findings: Vec::new(),
        };
        for bid in bids {
            ctx.check()?;
            let Some(list) = snapshot.state.block_list(tlf, bid) else {
                continue;
            };
            let mut prev: Option<RootMetadataSigned> = if bid.is_null() {
                None
            } else {
                snapshot.state.merged_at(tlf, list.initial_revision.prev())?
            };

            for (i, block) in list.blocks.iter().enumerate() {
                report.blocks_checked += 1;
                let revision = list.initial_revision + i as i64;
                let mut finding = |problem: String| {
                    warn!(tlf = %tlf, branch = %bid, revision = %revision, "audit: {problem}");
                    report.findings.push(AuditFinding {
                        branch: bid,
                        revision,
                        problem,
                    });
                };

                let rmds = match block.decode() {
                    Ok(rmds) => rmds,
                    Err(e) => {
                        finding(format!("undecodable block: {e}"));
                        prev = None;
                        continue;
                    }
                };
                if rmds.revision() != revision {
                    finding(format!("stored at revision {revision} but claims {}", rmds.revision()));
                }
                if rmds.md.tlf_id() != tlf || rmds.md.branch_id() != bid {
                    finding(format!(
                        "block belongs to folder {} branch {}",
                        rmds.md.tlf_id(),
                        rmds.md.branch_id()
                    ));
                }
                if let Err(e) = validate::is_valid_and_signed(ctx, &rmds, self.teams()).await {
                    finding(format!("invalid block: {e:#}"));
                }
                if let Some(prev) = &prev {
                    let check = prev
                        .md_id()
                        .map_err(|e| e.to_string())
                        .and_then(|prev_id| prev.md.check_valid_successor(&prev_id, &rmds.md).map_err(|e| e.to_string()));
                    if let Err(e) = check {
                        finding(format!("broken link from revision {}: {e}", prev.revision()));
                    }
                }
                prev = Some(rmds);
            }
        }
        debug!(
            tlf = %tlf,
            blocks = report.blocks_checked,
            findings = report.findings.len(),
            "audit done"
        );
        Ok(report)
    }
}

impl MdServerDisk {
    pub async fn folders(&self) -> ServerResult<Vec<FolderSummary>> {
        self.memory().folders().await
    }

    pub async fn list_blocks(&self, tlf: TlfId, bid: BranchId) -> ServerResult<Vec<BlockSummary>> {
        self.memory().list_blocks(tlf, bid).await
    }

    pub async fn audit(&self, ctx: &RequestContext, tlf: TlfId) -> ServerResult<AuditReport> {
        self.memory().audit(ctx, tlf).await
    }
}
