//! Versioned repository engine.
//!
//! A repository owns a chain of immutable versions, each an ordered set of
//! content references. Mutations never touch an existing version; they
//! compute a new content set and commit it as the next version number.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use ociclient::OciDigest;

use crate::content::{ManifestRow, SignatureRow};
use crate::error::{AppError, Result};

/// A typed reference to one content unit.
///
/// Tags carry their manifest binding; everything else is addressed by
/// digest alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContentRef {
    Blob(OciDigest),
    Manifest(OciDigest),
    Tag { name: String, manifest: OciDigest },
    Signature(OciDigest),
}

impl ContentRef {
    pub fn kind(&self) -> &'static str {
        match self {
            ContentRef::Blob(_) => "blob",
            ContentRef::Manifest(_) => "manifest",
            ContentRef::Tag { .. } => "tag",
            ContentRef::Signature(_) => "signature",
        }
    }
}

/// An immutable snapshot of repository content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryVersion {
    pub number: u64,
    pub base_version: u64,
    pub content: BTreeSet<ContentRef>,
}

impl RepositoryVersion {
    pub fn contains(&self, content_ref: &ContentRef) -> bool {
        self.content.contains(content_ref)
    }

    pub fn contains_manifest(&self, digest: &OciDigest) -> bool {
        self.content
            .contains(&ContentRef::Manifest(digest.clone()))
    }

    pub fn contains_blob(&self, digest: &OciDigest) -> bool {
        self.content.contains(&ContentRef::Blob(digest.clone()))
    }

    /// The manifest a tag name points at, if the tag exists here.
    pub fn tag(&self, name: &str) -> Option<OciDigest> {
        self.content.iter().find_map(|r| match r {
            ContentRef::Tag { name: n, manifest } if n == name => Some(manifest.clone()),
            _ => None,
        })
    }

    /// Tag names in this version, in lexical order.
    pub fn tag_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .content
            .iter()
            .filter_map(|r| match r {
                ContentRef::Tag { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    pub fn tags(&self) -> Vec<(String, OciDigest)> {
        self.content
            .iter()
            .filter_map(|r| match r {
                ContentRef::Tag { name, manifest } => Some((name.clone(), manifest.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn manifest_digests(&self) -> Vec<OciDigest> {
        self.content
            .iter()
            .filter_map(|r| match r {
                ContentRef::Manifest(digest) => Some(digest.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Per-type content counts of a version diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentSummary {
    pub added: BTreeMap<&'static str, u64>,
    pub removed: BTreeMap<&'static str, u64>,
    pub present: BTreeMap<&'static str, u64>,
}

fn count_by_kind(refs: impl Iterator<Item = &'static str>) -> BTreeMap<&'static str, u64> {
    let mut counts = BTreeMap::new();
    for kind in refs {
        *counts.entry(kind).or_insert(0) += 1;
    }
    counts
}

/// Diff two versions into per-type added/removed/present counts.
pub fn diff(a: &RepositoryVersion, b: &RepositoryVersion) -> ContentSummary {
    ContentSummary {
        added: count_by_kind(b.content.difference(&a.content).map(ContentRef::kind)),
        removed: count_by_kind(a.content.difference(&b.content).map(ContentRef::kind)),
        present: count_by_kind(b.content.iter().map(ContentRef::kind)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    /// Writable through the Distribution API
    Push,
    /// Mirrored from a remote; the API rejects writes
    Sync,
}

/// A named collection of content with a monotonically advancing version
/// chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub kind: RepositoryKind,
    pub versions: BTreeMap<u64, RepositoryVersion>,
    pub latest_version: u64,
    /// Blobs uploaded ahead of the manifest that will reference them
    pub pending_blobs: HashSet<OciDigest>,
    /// Manifests stored ahead of version membership (listed manifests,
    /// pull-through fetches)
    pub pending_manifests: HashSet<OciDigest>,
}

impl Repository {
    pub fn new(name: impl Into<String>, kind: RepositoryKind) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert(
            0,
            RepositoryVersion {
                number: 0,
                base_version: 0,
                content: BTreeSet::new(),
            },
        );
        Self {
            name: name.into(),
            kind,
            versions,
            latest_version: 0,
            pending_blobs: HashSet::new(),
            pending_manifests: HashSet::new(),
        }
    }

    pub fn latest(&self) -> &RepositoryVersion {
        &self.versions[&self.latest_version]
    }

    pub fn version(&self, number: u64) -> Option<&RepositoryVersion> {
        self.versions.get(&number)
    }

    /// Commit a content set as the next version.
    ///
    /// An unchanged set does not advance the chain; callers get the current
    /// version back.
    pub fn commit(&mut self, content: BTreeSet<ContentRef>) -> u64 {
        if self.latest().content == content {
            return self.latest_version;
        }
        let number = self.latest_version + 1;
        self.versions.insert(
            number,
            RepositoryVersion {
                number,
                base_version: self.latest_version,
                content,
            },
        );
        self.latest_version = number;
        number
    }

    /// Drop all versions but the latest. Used by pull-through repositories,
    /// which only ever serve their newest snapshot.
    pub fn prune_versions(&mut self) {
        let latest = self.latest_version;
        self.versions.retain(|number, _| *number == latest);
    }

    /// Bind a tag name to a manifest already present in the repository.
    ///
    /// An existing binding of the same name is replaced in the new
    /// version.
    pub fn tag(
        &mut self,
        digest: &OciDigest,
        name: &str,
        manifests: &HashMap<OciDigest, ManifestRow>,
    ) -> Result<u64> {
        if !self.latest().contains_manifest(digest) {
            return Err(AppError::ManifestNotFound(digest.to_string()));
        }
        let refs = vec![ContentRef::Tag {
            name: name.to_string(),
            manifest: digest.clone(),
        }];
        let content = recursive_add(self.latest(), &refs, manifests);
        Ok(self.commit(content))
    }

    /// Remove a tag binding, leaving the tagged content in place.
    pub fn untag(&mut self, name: &str) -> Result<u64> {
        let manifest = self
            .latest()
            .tag(name)
            .ok_or_else(|| AppError::ManifestNotFound(name.to_string()))?;
        let mut content = self.latest().content.clone();
        content.remove(&ContentRef::Tag {
            name: name.to_string(),
            manifest,
        });
        Ok(self.commit(content))
    }
}

/// Expand one manifest into its full closure of references.
///
/// Listed manifests recurse; image manifests pull in their config and layer
/// blobs. A digest with no graph row yet (deferred sub-manifest under an
/// on-demand policy) still contributes its own reference.
pub fn manifest_closure(
    digest: &OciDigest,
    manifests: &HashMap<OciDigest, ManifestRow>,
    out: &mut BTreeSet<ContentRef>,
) {
    if !out.insert(ContentRef::Manifest(digest.clone())) {
        return;
    }
    let Some(row) = manifests.get(digest) else {
        return;
    };
    match &row.kind {
        crate::content::ManifestKind::Index { manifests: subs } => {
            for sub in subs {
                manifest_closure(&sub.digest, manifests, out);
            }
        }
        crate::content::ManifestKind::Image { .. } => {
            for blob in row.blob_digests() {
                out.insert(ContentRef::Blob(blob));
            }
        }
    }
}

/// Compute the content set of a version extended by `refs` and their
/// closures.
///
/// Adding a tag whose name already exists replaces the old binding
/// (non-recursively); the displaced manifest stays unless removed
/// separately.
pub fn recursive_add(
    base: &RepositoryVersion,
    refs: &[ContentRef],
    manifests: &HashMap<OciDigest, ManifestRow>,
) -> BTreeSet<ContentRef> {
    let mut content = base.content.clone();
    for content_ref in refs {
        match content_ref {
            ContentRef::Tag { name, manifest } => {
                content.retain(|r| !matches!(r, ContentRef::Tag { name: n, .. } if n == name));
                content.insert(content_ref.clone());
                manifest_closure(manifest, manifests, &mut content);
            }
            ContentRef::Manifest(digest) => {
                manifest_closure(digest, manifests, &mut content);
            }
            ContentRef::Blob(_) | ContentRef::Signature(_) => {
                content.insert(content_ref.clone());
            }
        }
    }
    content
}

fn is_list(digest: &OciDigest, manifests: &HashMap<OciDigest, ManifestRow>) -> bool {
    manifests.get(digest).map(ManifestRow::is_list).unwrap_or(false)
}

/// Compute the content set of a version with `refs` and their closures
/// removed.
///
/// Content referenced by anything that remains in the version is preserved:
/// a manifest stays while another list still lists it, a blob stays while
/// another manifest still layers it.
pub fn recursive_remove(
    base: &RepositoryVersion,
    refs: &[ContentRef],
    manifests: &HashMap<OciDigest, ManifestRow>,
    signatures: &HashMap<OciDigest, SignatureRow>,
) -> BTreeSet<ContentRef> {
    let mut user_tags: HashSet<String> = HashSet::new();
    let mut user_manifests: HashSet<OciDigest> = HashSet::new();
    let mut user_blobs: HashSet<OciDigest> = HashSet::new();
    let mut user_signatures: HashSet<OciDigest> = HashSet::new();
    for content_ref in refs {
        match content_ref {
            ContentRef::Tag { name, .. } => {
                user_tags.insert(name.clone());
            }
            ContentRef::Manifest(digest) => {
                user_manifests.insert(digest.clone());
            }
            ContentRef::Blob(digest) => {
                user_blobs.insert(digest.clone());
            }
            ContentRef::Signature(digest) => {
                user_signatures.insert(digest.clone());
            }
        }
    }

    let version_tags: Vec<(String, OciDigest)> = base.tags();
    let version_manifests: HashSet<OciDigest> = base.manifest_digests().into_iter().collect();
    let version_blobs: HashSet<OciDigest> = base
        .content
        .iter()
        .filter_map(|r| match r {
            ContentRef::Blob(digest) => Some(digest.clone()),
            _ => None,
        })
        .collect();

    // Tags have no must_remain set; they are the highest level of content.
    let tags_to_remove: HashSet<String> = version_tags
        .iter()
        .filter(|(name, _)| user_tags.contains(name))
        .map(|(name, _)| name.clone())
        .collect();
    let tagged_must_remain: HashSet<OciDigest> = version_tags
        .iter()
        .filter(|(name, _)| !tags_to_remove.contains(name))
        .map(|(_, digest)| digest.clone())
        .collect();
    let tagged_to_remove: HashSet<OciDigest> = version_tags
        .iter()
        .filter(|(name, _)| tags_to_remove.contains(name))
        .map(|(_, digest)| digest.clone())
        .collect();

    // Manifest lists.
    let lists_must_remain: HashSet<OciDigest> = version_manifests
        .iter()
        .filter(|d| is_list(d, manifests) && tagged_must_remain.contains(*d))
        .cloned()
        .collect();
    let lists_to_remove: HashSet<OciDigest> = version_manifests
        .iter()
        .filter(|d| is_list(d, manifests))
        .filter(|d| user_manifests.contains(*d) || tagged_to_remove.contains(*d))
        .filter(|d| !lists_must_remain.contains(*d))
        .cloned()
        .collect();
    let lists_to_remain: HashSet<OciDigest> = version_manifests
        .iter()
        .filter(|d| is_list(d, manifests) && !lists_to_remove.contains(*d))
        .cloned()
        .collect();

    let listed_by = |lists: &HashSet<OciDigest>| -> HashSet<OciDigest> {
        lists
            .iter()
            .filter_map(|d| manifests.get(d))
            .flat_map(|row| row.sub_manifests().iter().map(|s| s.digest.clone()))
            .collect()
    };
    let listed_must_remain = listed_by(&lists_to_remain);
    let listed_to_remove = listed_by(&lists_to_remove);

    // Image manifests.
    let manifests_must_remain: HashSet<OciDigest> = version_manifests
        .iter()
        .filter(|d| !is_list(d, manifests))
        .filter(|d| tagged_must_remain.contains(*d) || listed_must_remain.contains(*d))
        .cloned()
        .collect();
    let manifests_to_remove: HashSet<OciDigest> = version_manifests
        .iter()
        .filter(|d| !is_list(d, manifests))
        .filter(|d| {
            user_manifests.contains(*d)
                || listed_to_remove.contains(*d)
                || tagged_to_remove.contains(*d)
        })
        .filter(|d| !manifests_must_remain.contains(*d))
        .cloned()
        .collect();
    let manifests_to_remain: HashSet<OciDigest> = version_manifests
        .iter()
        .filter(|d| !is_list(d, manifests) && !manifests_to_remove.contains(*d))
        .cloned()
        .collect();

    // Blobs.
    let blobs_of = |set: &HashSet<OciDigest>| -> HashSet<OciDigest> {
        set.iter()
            .filter_map(|d| manifests.get(d))
            .flat_map(|row| row.blob_digests())
            .collect()
    };
    let blobs_must_remain = blobs_of(&manifests_to_remain);
    let listed_blobs_to_remove = blobs_of(&manifests_to_remove);
    let blobs_to_remove: HashSet<OciDigest> = version_blobs
        .iter()
        .filter(|d| user_blobs.contains(*d) || listed_blobs_to_remove.contains(*d))
        .filter(|d| !blobs_must_remain.contains(*d))
        .cloned()
        .collect();

    // Signatures are never shared between manifests. The cascade follows
    // removed image manifests only; list-level signatures stay put.
    let signatures_to_remove: HashSet<OciDigest> = base
        .content
        .iter()
        .filter_map(|r| match r {
            ContentRef::Signature(digest) => Some(digest.clone()),
            _ => None,
        })
        .filter(|d| {
            user_signatures.contains(d)
                || signatures
                    .get(d)
                    .map(|row| manifests_to_remove.contains(&row.signed_manifest))
                    .unwrap_or(false)
        })
        .collect();

    base.content
        .iter()
        .filter(|r| match r {
            ContentRef::Tag { name, .. } => !tags_to_remove.contains(name),
            ContentRef::Manifest(digest) => {
                !lists_to_remove.contains(digest) && !manifests_to_remove.contains(digest)
            }
            ContentRef::Blob(digest) => !blobs_to_remove.contains(digest),
            ContentRef::Signature(digest) => !signatures_to_remove.contains(digest),
        })
        .cloned()
        .collect()
}

/// Recursive add of named tags (all when `names` is `None`) from one
/// version into another.
pub fn copy_tags(
    src: &RepositoryVersion,
    dst: &RepositoryVersion,
    names: Option<&[String]>,
    manifests: &HashMap<OciDigest, ManifestRow>,
) -> Result<BTreeSet<ContentRef>> {
    let mut refs = Vec::new();
    match names {
        Some(names) => {
            for name in names {
                let manifest = src.tag(name).ok_or_else(|| {
                    AppError::ManifestNotFound(format!("tag {name} is not in the source version"))
                })?;
                refs.push(ContentRef::Tag {
                    name: name.clone(),
                    manifest,
                });
            }
        }
        None => {
            for (name, manifest) in src.tags() {
                refs.push(ContentRef::Tag { name, manifest });
            }
        }
    }
    Ok(recursive_add(dst, &refs, manifests))
}

/// Selector for `copy_manifests`.
pub enum ManifestSelector<'a> {
    Digests(&'a [OciDigest]),
    MediaTypes(&'a [&'a str]),
}

/// Recursive add of selected manifests from one version into another.
pub fn copy_manifests(
    src: &RepositoryVersion,
    dst: &RepositoryVersion,
    selector: ManifestSelector<'_>,
    manifests: &HashMap<OciDigest, ManifestRow>,
) -> Result<BTreeSet<ContentRef>> {
    let mut refs = Vec::new();
    match selector {
        ManifestSelector::Digests(digests) => {
            for digest in digests {
                if !src.contains_manifest(digest) {
                    return Err(AppError::ManifestNotFound(format!(
                        "manifest {digest} is not in the source version"
                    )));
                }
                refs.push(ContentRef::Manifest(digest.clone()));
            }
        }
        ManifestSelector::MediaTypes(media_types) => {
            for digest in src.manifest_digests() {
                if let Some(row) = manifests.get(&digest) {
                    if media_types.contains(&row.media_type.as_str()) {
                        refs.push(ContentRef::Manifest(digest));
                    }
                }
            }
        }
    }
    Ok(recursive_add(dst, &refs, manifests))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{Characteristics, LayerRef, ManifestKind, SubManifestRef};

    fn digest(seed: &str) -> OciDigest {
        OciDigest::sha256_of(seed.as_bytes())
    }

    fn image_row(seed: &str, config: &str, layers: &[&str]) -> ManifestRow {
        ManifestRow {
            digest: digest(seed),
            media_type: ociclient::media_type::MANIFEST_OCI.to_string(),
            schema_version: 2,
            size: 100,
            kind: ManifestKind::Image {
                config: Some(digest(config)),
                layers: layers
                    .iter()
                    .map(|l| LayerRef {
                        digest: digest(l),
                        media_type: ociclient::media_type::REGULAR_BLOB_OCI.to_string(),
                        size: 10,
                    })
                    .collect(),
            },
            annotations: Default::default(),
            labels: Default::default(),
            characteristics: Characteristics::default(),
        }
    }

    fn list_row(seed: &str, subs: &[&str]) -> ManifestRow {
        ManifestRow {
            digest: digest(seed),
            media_type: ociclient::media_type::INDEX_OCI.to_string(),
            schema_version: 2,
            size: 100,
            kind: ManifestKind::Index {
                manifests: subs
                    .iter()
                    .map(|s| SubManifestRef {
                        digest: digest(s),
                        media_type: ociclient::media_type::MANIFEST_OCI.to_string(),
                        platform: None,
                    })
                    .collect(),
            },
            annotations: Default::default(),
            labels: Default::default(),
            characteristics: Characteristics::default(),
        }
    }

    fn table(rows: Vec<ManifestRow>) -> HashMap<OciDigest, ManifestRow> {
        rows.into_iter().map(|r| (r.digest.clone(), r)).collect()
    }

    fn tag(name: &str, manifest_seed: &str) -> ContentRef {
        ContentRef::Tag {
            name: name.to_string(),
            manifest: digest(manifest_seed),
        }
    }

    #[test]
    fn adding_a_tag_pulls_in_the_manifest_closure() {
        let mut repo = Repository::new("alice/img", RepositoryKind::Push);
        let manifests = table(vec![image_row("m1", "c1", &["l1", "l2"])]);

        let content = recursive_add(repo.latest(), &[tag("v1", "m1")], &manifests);
        let version = repo.commit(content);
        assert_eq!(version, 1);

        let latest = repo.latest();
        assert!(latest.contains(&tag("v1", "m1")));
        assert!(latest.contains_manifest(&digest("m1")));
        assert!(latest.contains_blob(&digest("c1")));
        assert!(latest.contains_blob(&digest("l1")));
        assert!(latest.contains_blob(&digest("l2")));
        assert_eq!(latest.content.len(), 5);
    }

    #[test]
    fn adding_a_list_pulls_in_sub_manifest_closures() {
        let mut repo = Repository::new("alice/multi", RepositoryKind::Push);
        let manifests = table(vec![
            list_row("ml", &["m1", "m2"]),
            image_row("m1", "c1", &["l1"]),
            image_row("m2", "c2", &["l2"]),
        ]);

        let content = recursive_add(
            repo.latest(),
            &[ContentRef::Manifest(digest("ml"))],
            &manifests,
        );
        repo.commit(content);

        let latest = repo.latest();
        assert!(latest.contains_manifest(&digest("ml")));
        assert!(latest.contains_manifest(&digest("m1")));
        assert!(latest.contains_manifest(&digest("m2")));
        assert!(latest.contains_blob(&digest("l1")));
        assert!(latest.contains_blob(&digest("c2")));
    }

    #[test]
    fn tagging_an_existing_name_replaces_the_binding() {
        let mut repo = Repository::new("alice/img", RepositoryKind::Push);
        let manifests = table(vec![
            image_row("m1", "c1", &["l1"]),
            image_row("m2", "c2", &["l2"]),
        ]);

        let content = recursive_add(repo.latest(), &[tag("v1", "m1")], &manifests);
        repo.commit(content);
        let content = recursive_add(repo.latest(), &[tag("v1", "m2")], &manifests);
        repo.commit(content);

        let latest = repo.latest();
        assert_eq!(latest.tag("v1"), Some(digest("m2")));
        // The displaced manifest is not removed by a tag swap.
        assert!(latest.contains_manifest(&digest("m1")));
        assert_eq!(latest.tag_names(), vec!["v1".to_string()]);
    }

    #[test]
    fn remove_add_roundtrip_restores_the_base_version() {
        let mut repo = Repository::new("alice/img", RepositoryKind::Push);
        let manifests = table(vec![
            list_row("ml", &["m1"]),
            image_row("m1", "c1", &["l1"]),
        ]);
        let signatures = HashMap::new();

        let base = recursive_add(repo.latest(), &[tag("v1", "ml")], &manifests);
        repo.commit(base.clone());

        let added = recursive_add(repo.latest(), &[tag("v2", "ml")], &manifests);
        repo.commit(added);
        let removed = recursive_remove(
            repo.latest(),
            &[tag("v2", "ml")],
            &manifests,
            &signatures,
        );
        assert_eq!(removed, base);
    }

    #[test]
    fn shared_blobs_survive_a_recursive_remove() {
        let mut repo = Repository::new("alice/img", RepositoryKind::Push);
        // Two images share layer l-shared.
        let manifests = table(vec![
            image_row("m1", "c1", &["l-shared", "l1"]),
            image_row("m2", "c2", &["l-shared"]),
        ]);
        let signatures = HashMap::new();

        let content = recursive_add(
            repo.latest(),
            &[tag("v1", "m1"), tag("v2", "m2")],
            &manifests,
        );
        repo.commit(content);

        let content = recursive_remove(repo.latest(), &[tag("v1", "m1")], &manifests, &signatures);
        repo.commit(content);

        let latest = repo.latest();
        assert!(!latest.contains_manifest(&digest("m1")));
        assert!(!latest.contains_blob(&digest("l1")));
        assert!(!latest.contains_blob(&digest("c1")));
        // Still referenced by m2.
        assert!(latest.contains_blob(&digest("l-shared")));
        assert!(latest.contains_manifest(&digest("m2")));
    }

    #[test]
    fn listed_manifests_survive_while_another_list_remains() {
        let mut repo = Repository::new("alice/img", RepositoryKind::Push);
        let manifests = table(vec![
            list_row("ml1", &["m-shared"]),
            list_row("ml2", &["m-shared"]),
            image_row("m-shared", "c", &["l"]),
        ]);
        let signatures = HashMap::new();

        let content = recursive_add(
            repo.latest(),
            &[tag("a", "ml1"), tag("b", "ml2")],
            &manifests,
        );
        repo.commit(content);

        let content = recursive_remove(repo.latest(), &[tag("a", "ml1")], &manifests, &signatures);
        repo.commit(content);

        let latest = repo.latest();
        assert!(!latest.contains_manifest(&digest("ml1")));
        assert!(latest.contains_manifest(&digest("ml2")));
        assert!(latest.contains_manifest(&digest("m-shared")));
        assert!(latest.contains_blob(&digest("l")));
    }

    #[test]
    fn signatures_follow_their_removed_manifest() {
        let mut repo = Repository::new("alice/img", RepositoryKind::Push);
        let manifests = table(vec![image_row("m1", "c1", &["l1"])]);
        let sig = SignatureRow {
            digest: digest("sig1"),
            name: "sig".to_string(),
            kind: crate::content::SignatureKind::Atomic,
            signed_manifest: digest("m1"),
            key_id: None,
            timestamp: None,
            creator: None,
            data: String::new(),
        };
        let signatures: HashMap<OciDigest, SignatureRow> =
            [(sig.digest.clone(), sig)].into_iter().collect();

        let mut content = recursive_add(repo.latest(), &[tag("v1", "m1")], &manifests);
        content.insert(ContentRef::Signature(digest("sig1")));
        repo.commit(content);

        let content = recursive_remove(repo.latest(), &[tag("v1", "m1")], &manifests, &signatures);
        repo.commit(content);
        assert!(repo.latest().content.is_empty());
    }

    #[test]
    fn list_level_signatures_do_not_cascade() {
        let mut repo = Repository::new("alice/img", RepositoryKind::Push);
        let manifests = table(vec![
            list_row("ml", &["m1"]),
            image_row("m1", "c1", &["l1"]),
        ]);
        let sig = SignatureRow {
            digest: digest("sig-ml"),
            name: "sig".to_string(),
            kind: crate::content::SignatureKind::Atomic,
            signed_manifest: digest("ml"),
            key_id: None,
            timestamp: None,
            creator: None,
            data: String::new(),
        };
        let signatures: HashMap<OciDigest, SignatureRow> =
            [(sig.digest.clone(), sig)].into_iter().collect();

        let mut content = recursive_add(repo.latest(), &[tag("v1", "ml")], &manifests);
        content.insert(ContentRef::Signature(digest("sig-ml")));
        repo.commit(content);

        let content = recursive_remove(repo.latest(), &[tag("v1", "ml")], &manifests, &signatures);
        repo.commit(content);

        // The cascade only follows image manifests; a signature bound to
        // the removed list is kept unless named explicitly.
        let latest = repo.latest();
        assert!(!latest.contains_manifest(&digest("ml")));
        assert!(!latest.contains_manifest(&digest("m1")));
        assert!(latest.contains(&ContentRef::Signature(digest("sig-ml"))));

        let content = recursive_remove(
            repo.latest(),
            &[ContentRef::Signature(digest("sig-ml"))],
            &manifests,
            &signatures,
        );
        repo.commit(content);
        assert!(repo.latest().content.is_empty());
    }

    #[test]
    fn version_numbers_increase_and_old_versions_stay_intact() {
        let mut repo = Repository::new("alice/img", RepositoryKind::Push);
        let manifests = table(vec![image_row("m1", "c1", &["l1"])]);

        let content = recursive_add(repo.latest(), &[tag("v1", "m1")], &manifests);
        let v1 = repo.commit(content);
        let v1_content = repo.latest().content.clone();

        let content = recursive_remove(
            repo.latest(),
            &[tag("v1", "m1")],
            &manifests,
            &HashMap::new(),
        );
        let v2 = repo.commit(content);

        assert!(v2 > v1);
        assert_eq!(repo.version(v1).unwrap().content, v1_content);
        // Committing the identical set again does not advance the chain.
        let same = repo.latest().content.clone();
        assert_eq!(repo.commit(same), v2);
    }

    #[test]
    fn copy_tags_moves_closures_between_versions() {
        let manifests = table(vec![
            image_row("m1", "c1", &["l1"]),
            image_row("m2", "c2", &["l2"]),
        ]);
        let mut src = Repository::new("src", RepositoryKind::Push);
        let content = recursive_add(
            src.latest(),
            &[tag("v1", "m1"), tag("v2", "m2")],
            &manifests,
        );
        src.commit(content);

        let dst = Repository::new("dst", RepositoryKind::Push);
        let names = vec!["v2".to_string()];
        let content = copy_tags(src.latest(), dst.latest(), Some(&names), &manifests).unwrap();
        assert!(content.contains(&tag("v2", "m2")));
        assert!(!content.iter().any(|r| matches!(r, ContentRef::Tag { name, .. } if name == "v1")));
        assert!(content.contains(&ContentRef::Blob(digest("l2"))));
    }

    #[test]
    fn tag_and_untag_operate_on_present_manifests() {
        let manifests = table(vec![image_row("m1", "c1", &["l1"])]);
        let mut repo = Repository::new("r", RepositoryKind::Push);
        let content = recursive_add(
            repo.latest(),
            &[ContentRef::Manifest(digest("m1"))],
            &manifests,
        );
        repo.commit(content);

        let v = repo.tag(&digest("m1"), "stable", &manifests).unwrap();
        assert_eq!(repo.latest().tag("stable"), Some(digest("m1")));
        assert_eq!(v, repo.latest_version);

        // Untag drops the binding only; the manifest and blobs stay.
        repo.untag("stable").unwrap();
        assert_eq!(repo.latest().tag("stable"), None);
        assert!(repo.latest().contains_manifest(&digest("m1")));
        assert!(repo.latest().contains_blob(&digest("l1")));

        // Tagging an absent manifest or untagging an absent name fails.
        assert!(repo.tag(&digest("ghost"), "t", &manifests).is_err());
        assert!(repo.untag("ghost").is_err());
    }

    #[test]
    fn diff_counts_by_content_type() {
        let manifests = table(vec![image_row("m1", "c1", &["l1"])]);
        let mut repo = Repository::new("r", RepositoryKind::Push);
        let empty = repo.latest().clone();
        let content = recursive_add(repo.latest(), &[tag("v1", "m1")], &manifests);
        repo.commit(content);

        let summary = diff(&empty, repo.latest());
        assert_eq!(summary.added["tag"], 1);
        assert_eq!(summary.added["manifest"], 1);
        assert_eq!(summary.added["blob"], 2);
        assert!(summary.removed.is_empty());
    }
}
