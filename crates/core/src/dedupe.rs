use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::model::{CleanableItem, DuplicateGroup, ItemCategory};

const BACKUP_KEYWORDS: &[&str] = &["backup", "time machine", "history", "mirror", "snapshot"];

/// Group items sharing a file name and size. Content is never compared.
pub fn find_duplicates(items: &[CleanableItem]) -> Vec<DuplicateGroup> {
    let mut by_key: HashMap<(String, u64), Vec<&CleanableItem>> = HashMap::new();
    for item in items {
        by_key
            .entry((item.name.clone(), item.size_bytes))
            .or_default()
            .push(item);
    }

    let mut groups = Vec::new();
    for ((name, size), mut members) in by_key {
        let mut seen = HashSet::new();
        members.retain(|item| seen.insert(item.path.clone()));
        if members.len() < 2 {
            continue;
        }
        sort_original_first(&mut members);

        let paths = members
            .iter()
            .map(|item| item.path.clone())
            .collect::<Vec<PathBuf>>();
        let wasted = size.saturating_mul((paths.len() as u64).saturating_sub(1));
        let likely_intentional = looks_intentional(&paths);
        groups.push(DuplicateGroup {
            name,
            size_bytes: size,
            paths,
            wasted_bytes: wasted,
            likely_intentional,
        });
    }

    groups.sort_by(|a, b| {
        b.wasted_bytes
            .cmp(&a.wasted_bytes)
            .then_with(|| b.paths.len().cmp(&a.paths.len()))
            .then_with(|| a.name.cmp(&b.name))
    });
    groups
}

/// Drop `duplicates` category items that are not a redundant copy: singletons
/// and the original (oldest) member of each group. Returns the dropped items.
pub fn retain_redundant_copies(items: &mut Vec<CleanableItem>) -> Vec<CleanableItem> {
    let candidates = items
        .iter()
        .filter(|item| item.category == ItemCategory::Duplicates)
        .cloned()
        .collect::<Vec<_>>();
    let redundant = find_duplicates(&candidates)
        .into_iter()
        .flat_map(|group| group.paths.into_iter().skip(1))
        .collect::<HashSet<_>>();

    let (kept, dropped): (Vec<_>, Vec<_>) = std::mem::take(items).into_iter().partition(|item| {
        item.category != ItemCategory::Duplicates || redundant.contains(&item.path)
    });
    *items = kept;
    dropped
}

fn sort_original_first(members: &mut [&CleanableItem]) {
    members.sort_by(|a, b| match (a.modified, b.modified) {
        (Some(left), Some(right)) => left.cmp(&right).then_with(|| a.path.cmp(&b.path)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.path.cmp(&b.path),
    });
}

fn looks_intentional(paths: &[PathBuf]) -> bool {
    paths.iter().any(|path| {
        let lowered = path.to_string_lossy().to_lowercase();
        BACKUP_KEYWORDS.iter().any(|keyword| lowered.contains(keyword))
    })
}
