use jsonptr::resolve::ResolveError;

use super::MappingError;
use crate::document::Document;
use crate::path::PathExpression;

/// Extract the value addressed by `path` from `source`
///
/// The source document must be a map. The path is resolved in its JSON pointer
/// form: member steps look up map members and index steps look up array
/// elements. Stepping into a scalar fails. Steps that may address more than
/// one value never match anything, those are rejected when the mapping is
/// validated.
pub fn extract(source: &Document, path: &PathExpression) -> Result<Document, MappingError> {
    if !source.is_map() {
        return Err(MappingError::SourceNotAMap);
    }

    let not_found = || MappingError::NoDataFound {
        query: path.to_string(),
    };

    let pointer = path.to_pointer().ok_or_else(not_found)?;
    match pointer.resolve(source.as_value()) {
        Ok(value) => Ok(Document::new(value.clone())),
        Err(ResolveError::Unreachable { .. }) => Err(MappingError::SourceNotAMap),
        Err(_) => Err(not_found()),
    }
}
