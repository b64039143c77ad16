//! Key bundle retrieval and private-section encryption.

use std::collections::HashSet;

use tracing::debug;

use tlfmd_core::{
    codec, BareRootMetadata, BranchId, KeyBundles, KeyGen, MergeStatus, PrivateMetadata, ReaderKeyBundleId,
    RequestContext, TlfType, WriterKeyBundleId,
};
use tlfmd_crypto::{decrypt_private_metadata, encrypt_private_metadata, TlfCryptKey};

use crate::error::{MdOpsError, OpsResult};
use crate::metadata::RootMetadata;
use crate::ops::MdOps;

impl MdOps {
    /// Bundles referenced by `md`, cache-first. `None` when the revision
    /// references no out-of-band bundles.
    pub(crate) async fn get_key_bundles(
        &self,
        ctx: &RequestContext,
        md: &BareRootMetadata,
    ) -> OpsResult<Option<KeyBundles>> {
        let wkb_id = md.writer_key_bundle_id;
        let rkb_id = md.reader_key_bundle_id;
        if wkb_id.is_zero() || rkb_id.is_zero() {
            return Ok(None);
        }
        let tlf = md.tlf_id();
        let bundles = &self.caches.bundles;
        let mut writer = bundles.writer_bundle(tlf, wkb_id);
        let mut reader = bundles.reader_bundle(tlf, rkb_id);

        if writer.is_none() || reader.is_none() {
            let want_writer = if writer.is_none() { wkb_id } else { WriterKeyBundleId::default() };
            let want_reader = if reader.is_none() { rkb_id } else { ReaderKeyBundleId::default() };
            let (fetched_writer, fetched_reader) = self
                .server
                .get_key_bundles(ctx, tlf, want_writer, want_reader)
                .await?;
            if let Some(w) = fetched_writer {
                bundles.put_writer_bundle(tlf, wkb_id, w.clone());
                writer = Some(w);
            }
            if let Some(r) = fetched_reader {
                bundles.put_reader_bundle(tlf, rkb_id, r.clone());
                reader = Some(r);
            }
        }

        match (writer, reader) {
            (Some(writer), Some(reader)) => Ok(Some(KeyBundles {
                writer,
                reader,
                writer_new: false,
                reader_new: false,
            })),
            _ => Err(MdOpsError::Other(anyhow::anyhow!(
                "key bundles {wkb_id}/{rkb_id} of folder {tlf} are unavailable"
            ))),
        }
    }

    /// Decrypt the private section of `md`. When its own bundles carry no
    /// key for this device, later revisions are searched for one.
    pub(crate) async fn decrypt_private(
        &self,
        ctx: &RequestContext,
        md: &BareRootMetadata,
        bundles: Option<&KeyBundles>,
    ) -> OpsResult<PrivateMetadata> {
        let tlf = md.tlf_id();
        let revision = md.revision;
        let decryption = |reason: String| MdOpsError::Decryption {
            tlf: tlf.to_string(),
            revision,
            reason,
        };
        let encrypted = &md.writer_metadata.serialized_private_metadata;

        if md.tlf_type() == Some(TlfType::Public) {
            return codec::decode(encrypted).map_err(|e| decryption(format!("{e:#}")));
        }

        let key_gen = md.latest_key_gen;
        let key = match self
            .keys
            .tlf_crypt_key(ctx, md, bundles, key_gen)
            .await
            .map_err(|e| decryption(format!("{e:#}")))?
        {
            Some(key) => key,
            None => self.find_key_in_later_revisions(ctx, md, key_gen).await?,
        };
        let plaintext =
            decrypt_private_metadata(&key, &tlf, key_gen, encrypted).map_err(|e| decryption(format!("{e:#}")))?;
        codec::decode(&plaintext).map_err(|e| decryption(format!("{e:#}")))
    }

    /// Walk merged revisions after `md` in batches until one's bundles give
    /// this device the key for `key_gen`.
    async fn find_key_in_later_revisions(
        &self,
        ctx: &RequestContext,
        md: &BareRootMetadata,
        key_gen: KeyGen,
    ) -> OpsResult<TlfCryptKey> {
        let tlf = md.tlf_id();
        let batch = self.batch_size();
        let mut tried = HashSet::new();
        tried.insert((md.writer_key_bundle_id, md.reader_key_bundle_id));
        let mut start = md.revision.next();
        debug!(tlf = %tlf, revision = %md.revision, key_gen = %key_gen, "searching later revisions for a key");

        loop {
            ctx.check()?;
            let stop = start + (batch as i64 - 1);
            let later = self
                .server
                .get_range(ctx, tlf, BranchId::NULL, MergeStatus::Merged, start, stop, None)
                .await?;
            for rmds in &later {
                let ids = (rmds.md.writer_key_bundle_id, rmds.md.reader_key_bundle_id);
                if !tried.insert(ids) {
                    continue;
                }
                let bundles = self.get_key_bundles(ctx, &rmds.md).await?;
                if let Some(key) = self.keys.tlf_crypt_key(ctx, &rmds.md, bundles.as_ref(), key_gen).await? {
                    debug!(tlf = %tlf, revision = %rmds.revision(), key_gen = %key_gen, "key found in later revision");
                    return Ok(key);
                }
            }
            let short = later.len() < batch;
            match later.last() {
                Some(last) if !short => start = last.revision().next(),
                _ => {
                    return Err(MdOpsError::KeyGenerationNotFound {
                        tlf: tlf.to_string(),
                        key_gen,
                    })
                }
            }
        }
    }

    /// Encode and, for non-public folders, encrypt the private section.
    pub(crate) async fn encrypt_private(&self, ctx: &RequestContext, rmd: &RootMetadata) -> OpsResult<Vec<u8>> {
        let plaintext = codec::encode(&rmd.data)?;
        if rmd.bare.tlf_type() == Some(TlfType::Public) {
            return Ok(plaintext);
        }
        let tlf = rmd.tlf_id();
        let key_gen = rmd.key_gen();
        let key = self
            .keys
            .tlf_crypt_key(ctx, &rmd.bare, rmd.bundles.as_ref(), key_gen)
            .await
            .map_err(|e| MdOpsError::Crypto(format!("{e:#}")))?
            .ok_or_else(|| MdOpsError::KeyGenerationNotFound {
                tlf: tlf.to_string(),
                key_gen,
            })?;
        encrypt_private_metadata(&key, &tlf, key_gen, &plaintext).map_err(|e| MdOpsError::Crypto(format!("{e:#}")))
    }
}
