use std::collections::HashSet;

use tracing::{debug, warn};

use crate::domain::Identifier;
use crate::error::SeqTaxError;

/// Largest numeric id the service accepts.
pub const MAX_ID_VALUE: u64 = u64::MAX;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validated {
    pub valid: Vec<Identifier>,
    pub invalid: Vec<String>,
}

/// Splits raw ids into usable identifiers and rejects, keeping input order and
/// dropping repeats. Fails when nothing usable remains.
pub fn validate_identifiers<I, S>(raw: I) -> Result<Validated, SeqTaxError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut validated = Validated::default();
    for value in raw {
        let value = value.as_ref();
        match value.parse::<Identifier>() {
            Ok(id) => {
                if seen.insert(id.clone()) {
                    validated.valid.push(id);
                }
            }
            Err(_) => validated.invalid.push(value.to_string()),
        }
    }

    if !validated.invalid.is_empty() {
        warn!("Some IDs have invalid value and were omitted. Maximum ID value {MAX_ID_VALUE}");
        debug!("omitted ids: {}", validated.invalid.join(", "));
    }

    if validated.valid.is_empty() {
        return Err(SeqTaxError::NoValidIdentifiers);
    }
    Ok(validated)
}
