use crate::pql::model::{
    InBookmarks, InPaths, MatchPath, MatchText, NeverMatch, QueryElement, TypeIn,
};
use crate::pql::utils::parse_and_escape_query;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PqlErrorKind {
    Validation,
    Structure,
    InvalidColumn,
}

impl std::fmt::Display for PqlErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PqlErrorKind::Validation => "validation error",
            PqlErrorKind::Structure => "structure error",
            PqlErrorKind::InvalidColumn => "invalid column",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug)]
pub(crate) struct PqlError {
    pub kind: PqlErrorKind,
    pub message: String,
}

impl PqlError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: PqlErrorKind::Validation,
            message: message.into(),
        }
    }

    pub(crate) fn structure(message: impl Into<String>) -> Self {
        Self {
            kind: PqlErrorKind::Structure,
            message: message.into(),
        }
    }

    pub(crate) fn invalid_column(message: impl Into<String>) -> Self {
        Self {
            kind: PqlErrorKind::InvalidColumn,
            message: message.into(),
        }
    }

    /// Back-compat shorthand used by filter builders for plain structural
    /// failures (malformed operand lists, impossible joins).
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::structure(message)
    }
}

impl std::fmt::Display for PqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for PqlError {}

/// Walks a query tree bottom-up, letting every filter normalize or elide
/// itself (`validate(self) -> Option<Self>`) and collapsing And/Or nodes that
/// lose all their operands. Elision is never an error: it is how a filter
/// says "this condition is a no-op, drop me", which is why `validate`
/// returns `Option<Self>` rather than `Result`.
pub(crate) fn preprocess_query(el: QueryElement) -> Result<Option<QueryElement>, PqlError> {
    match el {
        QueryElement::And(mut op) => {
            let mut cleaned = Vec::new();
            for sub_element in op.and_ {
                if let Some(subquery) = preprocess_query(sub_element)? {
                    cleaned.push(subquery);
                }
            }
            if cleaned.is_empty() {
                Ok(None)
            } else if cleaned.len() == 1 {
                Ok(Some(cleaned.remove(0)))
            } else {
                op.and_ = cleaned;
                Ok(Some(QueryElement::And(op)))
            }
        }
        QueryElement::Or(mut op) => {
            let mut cleaned = Vec::new();
            for sub_element in op.or_ {
                if let Some(subquery) = preprocess_query(sub_element)? {
                    cleaned.push(subquery);
                }
            }
            if cleaned.is_empty() {
                // Unlike And, an Or that loses every operand must not vanish:
                // `Or[TypeIn([]), TypeIn([])]` elides both children, but the
                // OR as written still means "none of these match", so it has
                // to become an explicit empty-result node. Eliding it here
                // would let an enclosing And silently drop this constraint.
                Ok(Some(QueryElement::Never(NeverMatch { never: true })))
            } else if cleaned.len() == 1 {
                Ok(Some(cleaned.remove(0)))
            } else {
                op.or_ = cleaned;
                Ok(Some(QueryElement::Or(op)))
            }
        }
        QueryElement::Not(mut op) => {
            // A NOT whose child elides is itself an elided no-op: dropping it
            // from an enclosing And/Or leaves the surrounding context
            // unchanged, which is the identity for that context.
            if let Some(subquery) = preprocess_query(*op.not_)? {
                op.not_ = Box::new(subquery);
                Ok(Some(QueryElement::Not(op)))
            } else {
                Ok(None)
            }
        }
        QueryElement::InPaths(filter) => Ok(filter.validate().map(QueryElement::InPaths)),
        QueryElement::TypeIn(filter) => Ok(filter.validate().map(QueryElement::TypeIn)),
        QueryElement::MatchPath(filter) => Ok(filter.validate().map(QueryElement::MatchPath)),
        QueryElement::MatchText(filter) => Ok(filter.validate().map(QueryElement::MatchText)),
        QueryElement::InBookmarks(filter) => Ok(filter.validate().map(QueryElement::InBookmarks)),
        QueryElement::Never(marker) => Ok(Some(QueryElement::Never(marker))),
    }
}

impl InPaths {
    fn validate(self) -> Option<Self> {
        if self.in_paths.in_paths.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl TypeIn {
    fn validate(self) -> Option<Self> {
        if self.type_in.type_in.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl MatchPath {
    fn validate(mut self) -> Option<Self> {
        if self.match_path.r#match.trim().is_empty() {
            return None;
        }
        if !self.match_path.raw_fts5_match {
            self.match_path.r#match = parse_and_escape_query(&self.match_path.r#match);
        }
        Some(self)
    }
}

impl MatchText {
    fn validate(mut self) -> Option<Self> {
        if !self.match_text.filter_only && self.match_text.r#match.trim().is_empty() {
            return None;
        }
        if self.match_text.filter_only {
            self.match_text.select_snippet_as = None;
            self.sort.order_by = false;
            self.sort.select_as = None;
            self.sort.row_n = false;
            self.match_text.r#match.clear();
        }
        if !self.match_text.raw_fts5_match {
            self.match_text.r#match = parse_and_escape_query(&self.match_text.r#match);
        }
        Some(self)
    }
}

impl InBookmarks {
    fn validate(self) -> Option<Self> {
        if self.in_bookmarks.filter {
            Some(self)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pql::model::{AndOperator, NotOperator, OrOperator, TypeInArgs};

    fn empty_type_in() -> QueryElement {
        QueryElement::TypeIn(TypeIn {
            type_in: TypeInArgs { type_in: vec![] },
        })
    }

    #[test]
    fn and_of_all_elided_children_elides() {
        let el = QueryElement::And(AndOperator {
            and_: vec![empty_type_in(), empty_type_in()],
        });
        assert!(preprocess_query(el).unwrap().is_none());
    }

    #[test]
    fn or_of_all_elided_children_becomes_never() {
        let el = QueryElement::Or(OrOperator {
            or_: vec![empty_type_in(), empty_type_in()],
        });
        let result = preprocess_query(el).unwrap().expect("or must not elide");
        assert!(matches!(result, QueryElement::Never(_)));
    }

    #[test]
    fn or_with_one_surviving_child_unwraps_to_that_child() {
        let el = QueryElement::Or(OrOperator {
            or_: vec![
                empty_type_in(),
                QueryElement::TypeIn(TypeIn {
                    type_in: TypeInArgs {
                        type_in: vec!["image".to_string()],
                    },
                }),
            ],
        });
        let result = preprocess_query(el).unwrap().expect("or must survive");
        assert!(matches!(result, QueryElement::TypeIn(_)));
    }

    #[test]
    fn not_of_elided_child_elides() {
        let el = QueryElement::Not(NotOperator {
            not_: Box::new(empty_type_in()),
        });
        assert!(preprocess_query(el).unwrap().is_none());
    }

    #[test]
    fn and_containing_an_all_elided_or_keeps_the_never_operand() {
        let el = QueryElement::And(AndOperator {
            and_: vec![
                QueryElement::TypeIn(TypeIn {
                    type_in: TypeInArgs {
                        type_in: vec!["image".to_string()],
                    },
                }),
                QueryElement::Or(OrOperator {
                    or_: vec![empty_type_in(), empty_type_in()],
                }),
            ],
        });
        let result = preprocess_query(el).unwrap().expect("and must survive");
        match result {
            QueryElement::And(op) => {
                assert_eq!(op.and_.len(), 2);
                assert!(matches!(op.and_[1], QueryElement::Never(_)));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }
}
