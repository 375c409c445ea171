/// A field filter narrowing what refreshes and updates on a stream contain.
///
/// Field identifiers are kept sorted and deduplicated so that subset and
/// union computations are linear scans.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ViewSpec {
    field_ids: Vec<u16>,
}

impl ViewSpec {
    pub fn new(ids: impl IntoIterator<Item = u16>) -> Self {
        let mut field_ids: Vec<u16> = ids.into_iter().collect();
        field_ids.sort_unstable();
        field_ids.dedup();
        Self { field_ids }
    }

    pub fn field_ids(&self) -> &[u16] {
        &self.field_ids
    }

    pub fn len(&self) -> usize {
        self.field_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field_ids.is_empty()
    }

    /// Whether every field of `self` also appears in `other`.
    pub fn is_subset_of(&self, other: &ViewSpec) -> bool {
        let mut theirs = other.field_ids.iter();
        'mine: for id in &self.field_ids {
            for candidate in theirs.by_ref() {
                if candidate == id {
                    continue 'mine;
                }
                if candidate > id {
                    return false;
                }
            }
            return false;
        }
        true
    }

    /// Whether one of the two views contains the other.
    pub fn is_comparable_with(&self, other: &ViewSpec) -> bool {
        self.is_subset_of(other) || other.is_subset_of(self)
    }

    /// The combined view containing every field of both inputs.
    pub fn union(&self, other: &ViewSpec) -> ViewSpec {
        let mut merged = Vec::with_capacity(self.field_ids.len() + other.field_ids.len());
        merged.extend_from_slice(&self.field_ids);
        merged.extend_from_slice(&other.field_ids);
        merged.sort_unstable();
        merged.dedup();
        ViewSpec { field_ids: merged }
    }
}
