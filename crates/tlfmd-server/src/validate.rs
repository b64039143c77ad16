//! Checks applied to a signed block before anyone trusts it. Shared by the
//! store (at Put time) and the engine (on every read).

use anyhow::Context;
use tlfmd_core::{
    BareRootMetadata, RequestContext, RootMetadataSigned, TeamMembership, TlfType, UserId, VerifyingKey,
};
use tlfmd_crypto::verify_signature;

/// Structure, both signatures, and writer/reader membership of the signers.
///
/// Team membership goes through `teams`, which lets the engine substitute a
/// checker that also accepts historical team writers.
pub async fn is_valid_and_signed(
    ctx: &RequestContext,
    rmds: &RootMetadataSigned,
    teams: &dyn TeamMembership,
) -> anyhow::Result<()> {
    let md = &rmds.md;
    md.check_well_formed()?;

    let payload = rmds.signed_payload()?;
    verify_signature(&payload, &rmds.sig_info).context("overall signature")?;

    if !md.is_writer_metadata_copied() {
        let writer_payload = md.writer_metadata_payload()?;
        verify_signature(&writer_payload, &md.writer_metadata_sig).context("writer metadata signature")?;
    }

    let writer = md.last_modifying_writer();
    let writer_key = &md.writer_metadata_sig.verifying_key;
    let user = &md.last_modifying_user;
    match (md.tlf_type(), md.team()) {
        (Some(TlfType::SingleTeam), Some(team)) => {
            if !md.is_writer_metadata_copied() && !teams.is_team_writer(ctx, team, writer, writer_key).await? {
                anyhow::bail!("{writer} is not a writer of team {team}");
            }
            if !teams.is_team_reader(ctx, team, user).await? {
                anyhow::bail!("{user} is not a reader of team {team}");
            }
        }
        _ => {
            if !md.is_writer(writer) {
                anyhow::bail!("last modifying writer {writer} is not a writer");
            }
            if !md.is_reader(user) {
                anyhow::bail!("last modifying user {user} is not a reader");
            }
        }
    }
    Ok(())
}

/// Whether the block claims `uid`/`key` as its last modifier.
pub fn is_last_modified_by(rmds: &RootMetadataSigned, uid: &UserId, key: &VerifyingKey) -> bool {
    let md = &rmds.md;
    if md.last_modifying_user != *uid || rmds.sig_info.verifying_key != *key {
        return false;
    }
    if md.is_writer_metadata_copied() {
        return true;
    }
    md.last_modifying_writer() == uid && md.writer_metadata_sig.verifying_key == *key
}

/// Is `uid` a writer according to `authority`, or is `new` a reader rekey
/// that leaves the writer metadata untouched?
///
/// `authority` is the current merged head, or the new block itself when the
/// folder has no history yet.
pub async fn is_writer_or_valid_rekey(
    ctx: &RequestContext,
    teams: &dyn TeamMembership,
    authority: &BareRootMetadata,
    new: &BareRootMetadata,
    uid: &UserId,
    key: &VerifyingKey,
) -> anyhow::Result<bool> {
    let (is_writer, is_reader) = match (authority.tlf_type(), authority.team()) {
        (Some(TlfType::SingleTeam), Some(team)) => {
            let writer = teams.is_team_writer(ctx, team, uid, key).await?;
            let reader = writer || teams.is_team_reader(ctx, team, uid).await?;
            (writer, reader)
        }
        _ => (authority.is_writer(uid), authority.is_reader(uid)),
    };
    if is_writer {
        return Ok(true);
    }
    if !is_reader || !new.is_rekey_set() || !new.is_writer_metadata_copied() {
        return Ok(false);
    }
    Ok(new.writer_metadata == authority.writer_metadata)
}

/// Reader check for fetches.
pub async fn is_reader(
    ctx: &RequestContext,
    teams: &dyn TeamMembership,
    md: &BareRootMetadata,
    uid: &UserId,
) -> anyhow::Result<bool> {
    match (md.tlf_type(), md.team()) {
        (Some(TlfType::SingleTeam), Some(team)) => teams.is_team_reader(ctx, team, uid).await,
        _ => Ok(md.is_reader(uid)),
    }
}
