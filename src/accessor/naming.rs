use crate::core::{AccessorError, Result};

/// Collection names starting with this prefix belong to the store.
pub const RESERVED_PREFIX: &str = "system";

const LEGAL_FIRST_CHARACTERS: &str = "_abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

const ILLEGAL_CHARACTERS: [char; 3] = [' ', '$', '\0'];

/// Checks that `name` can be used as a collection name.
///
/// The error carries a human readable reason.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let Some(first) = name.chars().next() else {
        return Err(AccessorError::InvalidName("name may not be empty".into()));
    };

    if name.starts_with(RESERVED_PREFIX) {
        return Err(AccessorError::InvalidName(format!(
            "name cannot start with \"{}\"",
            RESERVED_PREFIX
        )));
    }

    if !LEGAL_FIRST_CHARACTERS.contains(first) {
        return Err(AccessorError::InvalidName(format!(
            "name must start with one of the following characters: {}",
            LEGAL_FIRST_CHARACTERS
        )));
    }

    if name.contains(ILLEGAL_CHARACTERS) {
        return Err(AccessorError::InvalidName(
            "name cannot contain '$', ' ' or the null character (\\0)".into(),
        ));
    }

    Ok(())
}
