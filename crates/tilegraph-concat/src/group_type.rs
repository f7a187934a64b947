use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Alignment category of a concat input or group.
    ///
    /// Two categories can share a group when their intersection is non-empty; the intersection is
    /// the category of the merged group. The empty set is `NONE`: such an input always sits alone.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GroupType: u8 {
        const DEFAULT = 0b0001;
        /// Row footprint is a multiple of the alignment.
        const ALIGNED = 0b0010;
        const SMALL_TAIL = 0b0100;
        const SMALL_TAIL_AND_ALIGNED = Self::ALIGNED.bits() | Self::SMALL_TAIL.bits();
        /// The whole output is a single row.
        const SCALAR = 0b1000;
    }
}

impl GroupType {
    pub const NONE: GroupType = GroupType::empty();

    pub fn is_none(self) -> bool {
        self.is_empty()
    }

    /// Merged category, or `None` when the two cannot share a group.
    pub fn merge(self, other: GroupType) -> Option<GroupType> {
        let merged = self & other;
        (!merged.is_empty()).then_some(merged)
    }

    pub fn name(self) -> &'static str {
        if self == GroupType::NONE {
            "None"
        } else if self == GroupType::DEFAULT {
            "Default"
        } else if self == GroupType::ALIGNED {
            "Aligned"
        } else if self == GroupType::SMALL_TAIL {
            "SmallTail"
        } else if self == GroupType::SMALL_TAIL_AND_ALIGNED {
            "SmallTailAndAligned"
        } else if self == GroupType::SCALAR {
            "Scalar"
        } else {
            "Mixed"
        }
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-node classification state derived once by the partitioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    pub align_bytes: u64,
    pub is_scalar: bool,
    pub use_default_group: bool,
    pub can_use_small_tail: bool,
    pub small_tail_input_max_bytes: u64,
    pub scalar_input_max_elements: u64,
    pub small_tail_group_max_bytes: u64,
    pub default_cols_per_group: u64,
}

impl Classifier {
    /// Category of one input occupying `row_bytes` per row and `elements` elements per row.
    pub fn classify(&self, row_bytes: u64, elements: u64) -> GroupType {
        if self.is_scalar {
            return if elements <= self.scalar_input_max_elements {
                GroupType::SCALAR
            } else {
                GroupType::NONE
            };
        }
        if self.use_default_group {
            return GroupType::DEFAULT;
        }
        let aligned = self.align_bytes != 0 && row_bytes % self.align_bytes == 0;
        let small_tail = self.can_use_small_tail && row_bytes <= self.small_tail_input_max_bytes;
        match (aligned, small_tail) {
            (true, true) => GroupType::SMALL_TAIL_AND_ALIGNED,
            (true, false) => GroupType::ALIGNED,
            (false, true) => GroupType::SMALL_TAIL,
            (false, false) => GroupType::DEFAULT,
        }
    }

    /// Byte budget of a group of the given category.
    pub fn size_limit(&self, group_type: GroupType) -> u64 {
        if group_type == GroupType::SMALL_TAIL {
            self.small_tail_group_max_bytes
        } else {
            self.default_cols_per_group
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier {
            align_bytes: 32,
            is_scalar: false,
            use_default_group: false,
            can_use_small_tail: true,
            small_tail_input_max_bytes: 64,
            scalar_input_max_elements: 256,
            small_tail_group_max_bytes: 256,
            default_cols_per_group: 2048,
        }
    }

    #[test]
    fn merge_table_is_bitwise_intersection() {
        let all = [
            GroupType::NONE,
            GroupType::DEFAULT,
            GroupType::ALIGNED,
            GroupType::SMALL_TAIL,
            GroupType::SMALL_TAIL_AND_ALIGNED,
            GroupType::SCALAR,
        ];
        for a in all {
            for b in all {
                let merged = a.merge(b);
                assert_eq!(merged, b.merge(a), "merge must be symmetric for {a} and {b}");
                match merged {
                    Some(ty) => {
                        assert!(a.contains(ty) && b.contains(ty));
                        assert!(!ty.is_none());
                    }
                    None => assert!((a & b).is_empty()),
                }
            }
            assert_eq!(GroupType::NONE.merge(a), None);
        }
        assert_eq!(
            GroupType::SMALL_TAIL_AND_ALIGNED.merge(GroupType::SMALL_TAIL),
            Some(GroupType::SMALL_TAIL)
        );
        assert_eq!(
            GroupType::SMALL_TAIL_AND_ALIGNED.merge(GroupType::ALIGNED),
            Some(GroupType::ALIGNED)
        );
        assert_eq!(GroupType::DEFAULT.merge(GroupType::ALIGNED), None);
        assert_eq!(GroupType::SCALAR.merge(GroupType::DEFAULT), None);
    }

    #[test]
    fn classify_prefers_most_specific_category() {
        let c = classifier();
        assert_eq!(c.classify(32, 16), GroupType::SMALL_TAIL_AND_ALIGNED);
        assert_eq!(c.classify(96, 48), GroupType::ALIGNED);
        assert_eq!(c.classify(48, 24), GroupType::SMALL_TAIL);
        assert_eq!(c.classify(100, 50), GroupType::DEFAULT);

        let generic = Classifier {
            can_use_small_tail: false,
            ..c
        };
        assert_eq!(generic.classify(32, 16), GroupType::ALIGNED);
        assert_eq!(generic.classify(48, 24), GroupType::DEFAULT);
    }

    #[test]
    fn scalar_and_default_overrides() {
        let scalar = Classifier {
            is_scalar: true,
            ..classifier()
        };
        assert_eq!(scalar.classify(64, 32), GroupType::SCALAR);
        assert_eq!(scalar.classify(2048, 512), GroupType::NONE);

        let forced = Classifier {
            use_default_group: true,
            ..classifier()
        };
        assert_eq!(forced.classify(32, 16), GroupType::DEFAULT);
    }

    #[test]
    fn small_tail_has_the_tightest_budget() {
        let c = classifier();
        assert_eq!(c.size_limit(GroupType::SMALL_TAIL), 256);
        assert_eq!(c.size_limit(GroupType::SMALL_TAIL_AND_ALIGNED), 2048);
        assert_eq!(c.size_limit(GroupType::DEFAULT), 2048);
        assert_eq!(GroupType::SMALL_TAIL_AND_ALIGNED.to_string(), "SmallTailAndAligned");
    }
}
