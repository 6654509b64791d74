//! Mapping fresh clusters onto the persons from earlier passes.

use std::collections::BTreeMap;

use crate::db::PersonRef;

/// What a clustering pass knows about one face before it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorFace {
    pub face_id: i64,
    pub person_id: Option<i64>,
    pub locked: bool,
}

/// Target for every cluster, in cluster order, plus how many new persons
/// are needed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub targets: Vec<Option<PersonRef>>,
    pub new_persons: usize,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    cluster: usize,
    person_id: i64,
    overlap: f32,
    size: usize,
}

/// Decide which person each cluster becomes.
///
/// A cluster inherits a person when strictly more than `overlap_threshold`
/// of its previously assigned faces (locked ones included) point at that
/// person. When two clusters claim the same person, the higher overlap wins,
/// then the larger cluster, then the earlier cluster. Within one cluster a
/// tie between persons goes to the smaller person id. Clusters left without
/// a person get a new one, unless every member is locked and nothing would
/// be assigned to it.
pub fn reconcile(clusters: &[Vec<PriorFace>], overlap_threshold: f32) -> Reconciliation {
    let mut claims: Vec<Claim> = clusters
        .iter()
        .enumerate()
        .filter_map(|(cluster, members)| best_claim(cluster, members, overlap_threshold))
        .collect();

    claims.sort_by(|a, b| {
        b.overlap
            .partial_cmp(&a.overlap)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.size.cmp(&a.size))
            .then(a.cluster.cmp(&b.cluster))
    });

    let mut targets: Vec<Option<PersonRef>> = vec![None; clusters.len()];
    let mut taken: Vec<i64> = Vec::new();
    for claim in claims {
        if taken.contains(&claim.person_id) {
            continue;
        }
        taken.push(claim.person_id);
        targets[claim.cluster] = Some(PersonRef::Existing(claim.person_id));
    }

    let mut new_persons = 0;
    for (cluster, target) in targets.iter_mut().enumerate() {
        if target.is_some() || clusters[cluster].iter().all(|f| f.locked) {
            continue;
        }
        *target = Some(PersonRef::New(new_persons));
        new_persons += 1;
    }

    Reconciliation {
        targets,
        new_persons,
    }
}

fn best_claim(cluster: usize, members: &[PriorFace], overlap_threshold: f32) -> Option<Claim> {
    let mut votes: BTreeMap<i64, usize> = BTreeMap::new();
    for person_id in members.iter().filter_map(|f| f.person_id) {
        *votes.entry(person_id).or_default() += 1;
    }
    let assigned: usize = votes.values().sum();
    if assigned == 0 {
        return None;
    }

    // BTreeMap iterates in id order, so keeping the first maximum prefers
    // the smaller id
    let (person_id, count) = votes
        .iter()
        .fold(None, |best: Option<(i64, usize)>, (&id, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((id, count)),
        })?;

    let overlap = count as f32 / assigned as f32;
    (overlap > overlap_threshold).then_some(Claim {
        cluster,
        person_id,
        overlap,
        size: members.len(),
    })
}
