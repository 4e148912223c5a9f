//! The opening/ECO catalogue external collaborator.
//!
//! The catalogue's actual data (the full ECO corpus) is out of scope for
//! this service; [`StaticOpeningCatalogue`] carries a small illustrative
//! seed table sufficient to exercise the intent analyser's filter
//! extraction. Production deployments are expected to supply a richer
//! catalogue behind the same [`OpeningCatalogue`] trait.

#[derive(Debug, Clone)]
pub struct OpeningMatch {
    pub slug: String,
    pub eco_range: Option<(String, String)>,
}

pub trait OpeningCatalogue: Send + Sync {
    fn matches(&self, text: &str) -> Vec<OpeningMatch>;
}

struct Entry {
    slug: &'static str,
    aliases: &'static [&'static str],
    eco_range: Option<(&'static str, &'static str)>,
}

const ENTRIES: &[Entry] = &[
    Entry {
        slug: "kings-indian",
        aliases: &["king's indian", "kings indian", "king's indian defense", "kid"],
        eco_range: Some(("E60", "E99")),
    },
    Entry {
        slug: "sicilian-defense",
        aliases: &["sicilian", "sicilian defense", "sicilian defence"],
        eco_range: Some(("B20", "B99")),
    },
    Entry {
        slug: "queens-gambit",
        aliases: &["queen's gambit", "queens gambit", "qgd", "qga"],
        eco_range: Some(("D06", "D69")),
    },
    Entry {
        slug: "ruy-lopez",
        aliases: &["ruy lopez", "spanish opening", "spanish game"],
        eco_range: Some(("C60", "C99")),
    },
    Entry {
        slug: "french-defense",
        aliases: &["french defense", "french defence", "french"],
        eco_range: Some(("C00", "C19")),
    },
    Entry {
        slug: "caro-kann",
        aliases: &["caro-kann", "caro kann"],
        eco_range: Some(("B10", "B19")),
    },
    Entry {
        slug: "english-opening",
        aliases: &["english opening", "english"],
        eco_range: Some(("A10", "A39")),
    },
    Entry {
        slug: "nimzo-indian",
        aliases: &["nimzo-indian", "nimzo indian"],
        eco_range: Some(("E20", "E59")),
    },
];

pub struct StaticOpeningCatalogue;

impl OpeningCatalogue for StaticOpeningCatalogue {
    fn matches(&self, text: &str) -> Vec<OpeningMatch> {
        let lower = text.to_lowercase();
        let mut hits = Vec::new();
        for entry in ENTRIES {
            if entry.aliases.iter().any(|alias| lower.contains(alias)) {
                hits.push(OpeningMatch {
                    slug: entry.slug.to_string(),
                    eco_range: entry
                        .eco_range
                        .map(|(lo, hi)| (lo.to_string(), hi.to_string())),
                });
            }
        }
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_kings_indian() {
        let cat = StaticOpeningCatalogue;
        let hits = cat.matches("Show me King's Indian games where white is strong");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].slug, "kings-indian");
        assert_eq!(hits[0].eco_range.as_ref().unwrap().0, "E60");
    }

    #[test]
    fn no_match_returns_empty() {
        let cat = StaticOpeningCatalogue;
        assert!(cat.matches("games with a knight sacrifice").is_empty());
    }
}
