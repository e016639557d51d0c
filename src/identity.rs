//! Subject identity: connectivity over an arena of subject keys.

use std::collections::{BTreeMap, BTreeSet};

use strsim::normalized_levenshtein;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::crosswalk::CrosswalkTable;
use crate::diagnostics::DiagnosticRecord;
use crate::domain::{CanonicalObservation, CanonicalSubject, Modality, ResolutionMethod, SourceId};
use crate::error::KiraError;

/// Union-find over interned keys. Identical key strings share one slot.
#[derive(Debug, Default)]
struct KeyArena {
    slots: BTreeMap<String, usize>,
    keys: Vec<String>,
    parent: Vec<usize>,
    rank: Vec<u8>,
    sources: Vec<BTreeSet<SourceId>>,
    modalities: Vec<BTreeSet<Modality>>,
}

impl KeyArena {
    fn intern(&mut self, key: &str) -> usize {
        if let Some(&slot) = self.slots.get(key) {
            return slot;
        }
        let slot = self.keys.len();
        self.slots.insert(key.to_string(), slot);
        self.keys.push(key.to_string());
        self.parent.push(slot);
        self.rank.push(0);
        self.sources.push(BTreeSet::new());
        self.modalities.push(BTreeSet::new());
        slot
    }

    fn slot(&self, key: &str) -> Option<usize> {
        self.slots.get(key).copied()
    }

    fn find(&mut self, slot: usize) -> usize {
        let mut root = slot;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = slot;
        while self.parent[current] != root {
            let next = self.parent[current];
            self.parent[current] = root;
            current = next;
        }
        root
    }

    /// Returns false when both slots were already connected.
    fn union(&mut self, left: usize, right: usize) -> bool {
        let (left, right) = (self.find(left), self.find(right));
        if left == right {
            return false;
        }
        let (root, child) = if self.rank[left] >= self.rank[right] {
            (left, right)
        } else {
            (right, left)
        };
        self.parent[child] = root;
        if self.rank[root] == self.rank[child] {
            self.rank[root] += 1;
        }
        true
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    /// Root -> member slots, in slot order.
    fn components(&mut self) -> BTreeMap<usize, Vec<usize>> {
        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for slot in 0..self.len() {
            let root = self.find(slot);
            components.entry(root).or_default().push(slot);
        }
        components
    }
}

/// A union that merged two previously separate components.
#[derive(Debug, Clone, Copy)]
struct Link {
    slot: usize,
    method: ResolutionMethod,
    confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityResolution {
    subjects: Vec<CanonicalSubject>,
    by_key: BTreeMap<String, usize>,
    pub ambiguities: Vec<DiagnosticRecord>,
}

impl IdentityResolution {
    /// Subjects ordered by canonical id.
    pub fn subjects(&self) -> &[CanonicalSubject] {
        &self.subjects
    }

    pub fn subject_for_key(&self, key: &str) -> Option<&CanonicalSubject> {
        self.by_key.get(key).map(|&index| &self.subjects[index])
    }

    pub fn subject_of(&self, observation: &CanonicalObservation) -> Option<&CanonicalSubject> {
        observation
            .subject_key_candidates
            .iter()
            .find_map(|key| self.subject_for_key(key))
    }

    pub fn subject(&self, canonical_id: &str) -> Option<&CanonicalSubject> {
        self.subjects
            .binary_search_by(|subject| subject.canonical_id.as_str().cmp(canonical_id))
            .ok()
            .map(|index| &self.subjects[index])
    }

    pub fn contains(&self, canonical_id: &str) -> bool {
        self.subject(canonical_id).is_some()
    }
}

/// Partitions every subject key in `observations` into canonical subjects.
///
/// Unions are applied in a fixed order: crosswalk tables (including derived
/// TCGA barcode links), keys co-reported on one observation, then fuzzy
/// matches between single-source components. A subject's method is the weakest
/// link that formed it.
pub fn resolve(
    observations: &[CanonicalObservation],
    crosswalks: &[CrosswalkTable],
    config: &RunConfig,
) -> Result<IdentityResolution, KiraError> {
    let mut arena = KeyArena::default();
    for observation in observations {
        for key in &observation.subject_key_candidates {
            let slot = arena.intern(key);
            arena.sources[slot].insert(observation.source_id);
            arena.modalities[slot].insert(observation.modality);
        }
    }

    let mut links = Vec::new();
    let derived = CrosswalkTable::tcga_barcodes(arena.keys.iter().map(String::as_str));
    // Configured tables bind keys of their declared sources; the barcode rule
    // is structural and applies to any source.
    let tables = crosswalks
        .iter()
        .map(|table| (table, true))
        .chain(std::iter::once((&derived, false)));
    for (table, declared) in tables {
        let mut applied = 0usize;
        let mut off_source = 0usize;
        for link in &table.links {
            let (Some(from), Some(to)) = (arena.slot(&link.from_key), arena.slot(&link.to_key))
            else {
                continue;
            };
            if declared
                && !(arena.sources[from].contains(&table.from_source)
                    && arena.sources[to].contains(&table.to_source))
            {
                off_source += 1;
                continue;
            }
            if arena.union(from, to) {
                applied += 1;
                links.push(Link {
                    slot: from,
                    method: ResolutionMethod::Crosswalk,
                    confidence: 1.0,
                });
            }
        }
        debug!(origin = %table.origin, applied, off_source, "crosswalk applied");
    }

    for observation in observations {
        let mut keys = observation.subject_key_candidates.iter();
        let Some(first) = keys.next().and_then(|key| arena.slot(key)) else {
            continue;
        };
        for key in keys {
            if let Some(slot) = arena.slot(key) {
                if arena.union(first, slot) {
                    links.push(Link {
                        slot: first,
                        method: ResolutionMethod::Exact,
                        confidence: 1.0,
                    });
                }
            }
        }
    }

    let mut ambiguities = Vec::new();
    for (left, right, score) in fuzzy_proposals(&mut arena, config, &mut ambiguities) {
        if arena.union(left, right) {
            links.push(Link {
                slot: left,
                method: ResolutionMethod::Fuzzy,
                confidence: score,
            });
        }
    }

    let resolution = build_subjects(&mut arena, &links, ambiguities)?;
    info!(
        keys = arena.len(),
        subjects = resolution.subjects.len(),
        ambiguous = resolution.ambiguities.len(),
        "identity resolved"
    );
    Ok(resolution)
}

/// Component summary used for fuzzy comparison.
struct Component {
    root: usize,
    label: String,
    sources: BTreeSet<SourceId>,
    modalities: BTreeSet<Modality>,
    forms: Vec<String>,
}

/// Upper-cased alphanumeric form used for similarity.
fn match_form(key: &str) -> String {
    key.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

/// Proposals are computed against a snapshot of the components so the result
/// does not depend on the order unions are applied.
fn fuzzy_proposals(
    arena: &mut KeyArena,
    config: &RunConfig,
    ambiguities: &mut Vec<DiagnosticRecord>,
) -> Vec<(usize, usize, f64)> {
    let components: Vec<Component> = arena
        .components()
        .into_iter()
        .map(|(root, slots)| {
            let mut sources = BTreeSet::new();
            let mut modalities = BTreeSet::new();
            let mut forms = Vec::with_capacity(slots.len());
            for &slot in &slots {
                sources.extend(arena.sources[slot].iter().copied());
                modalities.extend(arena.modalities[slot].iter().copied());
                forms.push(match_form(&arena.keys[slot]));
            }
            let label = slots
                .iter()
                .map(|&slot| arena.keys[slot].as_str())
                .min()
                .unwrap_or_default()
                .to_string();
            Component {
                root,
                label,
                sources,
                modalities,
                forms,
            }
        })
        .collect();

    let comparable = |left: &Component, right: &Component| {
        left.sources.is_disjoint(&right.sources)
            && left.modalities.iter().any(|&l| {
                right
                    .modalities
                    .iter()
                    .any(|&r| config.allows_fuzzy(l, r))
            })
    };

    let mut proposals = Vec::new();
    let mut ambiguous = BTreeSet::new();
    for (index, component) in components.iter().enumerate() {
        if component.sources.len() != 1 {
            continue;
        }
        let matches: Vec<(usize, f64)> = components
            .iter()
            .enumerate()
            .filter(|(other, candidate)| *other != index && comparable(component, *candidate))
            .filter_map(|(other, candidate)| {
                let score = similarity(&component.forms, &candidate.forms);
                (score >= config.fuzzy_match_threshold).then_some((other, score))
            })
            .collect();
        match matches.as_slice() {
            [] => {}
            [(other, score)] => proposals.push((index, *other, *score)),
            _ => {
                let candidates: Vec<String> = matches
                    .iter()
                    .map(|(other, _)| components[*other].label.clone())
                    .collect();
                warn!(key = %component.label, candidates = ?candidates, "ambiguous fuzzy identity");
                ambiguities.push(DiagnosticRecord::ambiguous_identity(&component.label, &candidates));
                ambiguous.insert(index);
            }
        }
    }

    // Multi-source components never propose, so their ambiguity shows up only
    // as several proposers converging on them.
    let mut incoming: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for &(index, target, _) in &proposals {
        incoming.entry(target).or_default().push(index);
    }
    for (target, proposers) in incoming {
        if proposers.len() < 2 || ambiguous.contains(&target) {
            continue;
        }
        let label = &components[target].label;
        let candidates: Vec<String> = proposers
            .iter()
            .map(|&proposer| components[proposer].label.clone())
            .collect();
        warn!(key = %label, candidates = ?candidates, "ambiguous fuzzy identity");
        ambiguities.push(DiagnosticRecord::ambiguous_identity(label, &candidates));
        ambiguous.insert(target);
    }

    proposals
        .into_iter()
        .filter(|(index, target, _)| !ambiguous.contains(index) && !ambiguous.contains(target))
        .map(|(index, target, score)| (components[index].root, components[target].root, score))
        .collect()
}

/// Best normalized Levenshtein similarity between any pair of key forms.
fn similarity(left: &[String], right: &[String]) -> f64 {
    left.iter()
        .filter(|form| !form.is_empty())
        .flat_map(|l| {
            right
                .iter()
                .filter(|form| !form.is_empty())
                .map(move |r| normalized_levenshtein(l, r))
        })
        .fold(0.0, f64::max)
}

fn build_subjects(
    arena: &mut KeyArena,
    links: &[Link],
    ambiguities: Vec<DiagnosticRecord>,
) -> Result<IdentityResolution, KiraError> {
    let mut link_summary: BTreeMap<usize, (ResolutionMethod, f64)> = BTreeMap::new();
    for link in links {
        let root = arena.find(link.slot);
        let entry = link_summary
            .entry(root)
            .or_insert((ResolutionMethod::Exact, 1.0));
        entry.0 = entry.0.min(link.method);
        entry.1 = entry.1.min(link.confidence);
    }

    let mut subjects: Vec<CanonicalSubject> = arena
        .components()
        .into_iter()
        .map(|(root, slots)| {
            let member_keys: BTreeSet<String> =
                slots.iter().map(|&slot| arena.keys[slot].clone()).collect();
            let (resolution_method, confidence) = link_summary
                .get(&root)
                .copied()
                .unwrap_or((ResolutionMethod::Exact, 1.0));
            CanonicalSubject {
                canonical_id: member_keys.first().cloned().unwrap_or_default(),
                member_keys,
                resolution_method,
                confidence,
            }
        })
        .collect();
    subjects.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));

    let mut by_key = BTreeMap::new();
    for (index, subject) in subjects.iter().enumerate() {
        for key in &subject.member_keys {
            if by_key.insert(key.clone(), index).is_some() {
                return Err(KiraError::InternalConsistency(format!(
                    "subject key {key} belongs to more than one subject"
                )));
            }
        }
    }
    if by_key.len() != arena.len() {
        return Err(KiraError::InternalConsistency(format!(
            "{} subject keys resolved to {} subject memberships",
            arena.len(),
            by_key.len()
        )));
    }

    Ok(IdentityResolution {
        subjects,
        by_key,
        ambiguities,
    })
}
