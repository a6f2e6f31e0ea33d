//! Renders a [`Lineage`] as a `k__Fungi; p__Basidiomycota; ...` string.

use std::collections::HashMap;

use crate::domain::Lineage;

/// Ranks with fixed abbreviations, ordered from the root down.
const CANONICAL_RANKS: &[(&str, &str)] = &[
    ("domain", "d"),
    ("superkingdom", "sk"),
    ("kingdom", "k"),
    ("subkingdom", "ks"),
    ("superphylum", "sp"),
    ("phylum", "p"),
    ("subphylum", "ps"),
    ("infraphylum", "pi"),
    ("superclass", "sc"),
    ("class", "c"),
    ("subclass", "cs"),
    ("infraclass", "ci"),
    ("cohort", "co"),
    ("superorder", "so"),
    ("order", "o"),
    ("suborder", "os"),
    ("infraorder", "oi"),
    ("parvorder", "op"),
    ("superfamily", "sf"),
    ("family", "f"),
    ("subfamily", "fs"),
    ("tribe", "t"),
    ("subtribe", "ts"),
    ("genus", "g"),
    ("subgenus", "gs"),
    ("species group", "sg"),
    ("species subgroup", "sgs"),
    ("species", "s"),
    ("subspecies", "ssb"),
    ("varietas", "v"),
    ("forma", "for"),
];

pub fn canonical_ranks() -> &'static [(&'static str, &'static str)] {
    CANONICAL_RANKS
}

fn canonical_index(rank: &str) -> Option<usize> {
    CANONICAL_RANKS.iter().position(|(name, _)| *name == rank)
}

/// Short prefix used in front of `__`. Ranks outside the fixed table use the
/// first letter of each word.
pub fn abbreviation(rank: &str) -> String {
    if let Some(index) = canonical_index(rank) {
        return CANONICAL_RANKS[index].1.to_string();
    }
    rank.split([' ', '_', '-'])
        .filter_map(|part| part.chars().next())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Name for every rank the lineage can fill directly.
fn assign_slots(lineage: &Lineage) -> HashMap<&str, String> {
    let mut slots: HashMap<&str, String> = HashMap::new();
    for (rank, name) in &lineage.ancestors {
        slots.insert(rank.as_str(), name.clone());
    }
    slots.insert(lineage.rank.as_str(), lineage.scientific_name.clone());

    if let Some(genus) = lineage.name_at("genus") {
        if let Some(epithet) = lineage
            .scientific_name
            .strip_prefix(genus)
            .and_then(|rest| rest.strip_prefix(' '))
        {
            let epithet = epithet.trim();
            if !epithet.is_empty() {
                slots.insert("species", epithet.to_string());
            }
        }
    }

    if let Some(division) = lineage.division.as_deref().filter(|d| !d.trim().is_empty()) {
        slots.insert("domain", division.to_string());
    }
    slots
}

/// One `abbr__name` token per requested rank, in request order.
///
/// With `propagate`, a canonical rank with no name takes the nearest filled
/// rank above it in the canonical order, and any other missing rank repeats
/// the name rendered just before it.
pub fn format_lineage(lineage: &Lineage, ranks: &[String], propagate: bool) -> String {
    let slots = assign_slots(lineage);
    let mut previous: Option<&str> = None;
    let mut tokens = Vec::with_capacity(ranks.len());

    for rank in ranks {
        let rank = rank.as_str();
        let name = match slots.get(rank) {
            Some(name) => Some(name.as_str()),
            None if propagate => match canonical_index(rank) {
                Some(index) => CANONICAL_RANKS[..index]
                    .iter()
                    .rev()
                    .find_map(|(above, _)| slots.get(above))
                    .map(String::as_str),
                None => previous,
            },
            None => None,
        };
        tokens.push(format!("{}__{}", abbreviation(rank), name.unwrap_or("")));
        if name.is_some() {
            previous = name;
        }
    }
    tokens.join("; ")
}
