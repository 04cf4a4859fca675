//! Result classifier (spec §4.8), a pure function mapping (tool
//! status, task file name, property file content) to one of the
//! closed `ResultCategory` set, plus a scoring scheme. Ported from
//! `benchmark/result.py`'s `getResultCategory`/`calculateScore`
//! (see SPEC_FULL.md §12): same marker-substring tables, same
//! intersection logic, same score constants.

use crate::model::{PropertyKind, ResultCategory};

pub const STR_TRUE: &str = "true";
pub const STR_UNKNOWN: &str = "unknown";

/// (expected-verdict-is-true, PropertyKind) markers recognized in a
/// task's file name, by substring (spec §6.5 / result.py SUBSTRINGS).
/// A `_true-valid-memsafety` marker expands to three kinds at once,
/// exactly as the Python source does.
const FILENAME_MARKERS: &[(&str, bool, &[PropertyKind])] = &[
    ("_true-unreach-label", true, &[PropertyKind::Reach]),
    ("_true-unreach-call", true, &[PropertyKind::Reach]),
    ("_true-termination", true, &[PropertyKind::Termination]),
    ("_true-valid-deref", true, &[PropertyKind::ValidDeref]),
    ("_true-valid-free", true, &[PropertyKind::ValidFree]),
    ("_true-valid-memtrack", true, &[PropertyKind::ValidMemtrack]),
    (
        "_true-valid-memsafety",
        true,
        &[PropertyKind::ValidDeref, PropertyKind::ValidFree, PropertyKind::ValidMemtrack],
    ),
    ("_false-unreach-label", false, &[PropertyKind::Reach]),
    ("_false-unreach-call", false, &[PropertyKind::Reach]),
    ("_false-termination", false, &[PropertyKind::Termination]),
    ("_false-valid-deref", false, &[PropertyKind::ValidDeref]),
    ("_false-valid-free", false, &[PropertyKind::ValidFree]),
    ("_false-valid-memtrack", false, &[PropertyKind::ValidMemtrack]),
];

/// Substrings recognized in a property file's textual content (spec
/// §6.5 / result.py PROPERTY_MATCHER).
const PROPERTY_MATCHERS: &[(&str, PropertyKind)] = &[
    ("LTL(G ! label(", PropertyKind::Reach),
    ("LTL(G ! call(__VERIFIER_error()))", PropertyKind::Reach),
    ("LTL(F end)", PropertyKind::Termination),
    ("LTL(G valid-free)", PropertyKind::ValidFree),
    ("LTL(G valid-deref)", PropertyKind::ValidDeref),
    ("LTL(G valid-memtrack)", PropertyKind::ValidMemtrack),
];

/// A `(expected_true, kind)` marker found in a task file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMarker {
    pub expected_true: bool,
    pub kind: PropertyKind,
}

pub fn markers_of_filename(filename: &str) -> Vec<FileMarker> {
    let lower = filename.to_lowercase();
    let mut out = Vec::new();
    for (substr, expected_true, kinds) in FILENAME_MARKERS {
        if lower.contains(substr) {
            for kind in *kinds {
                out.push(FileMarker {
                    expected_true: *expected_true,
                    kind: *kind,
                });
            }
        }
    }
    out
}

pub fn kinds_of_property_file_content(content: &str) -> Vec<PropertyKind> {
    PROPERTY_MATCHERS
        .iter()
        .filter(|(substr, _)| content.contains(substr))
        .map(|(_, kind)| *kind)
        .collect()
}

/// The set of tool-reported status strings recognized as "known"
/// (spec §4.8 step 3); anything else is `error`. `false(<kind>)`
/// forms are recognized structurally rather than enumerated, mirroring
/// `STR_LIST` in result.py but generalized over `PropertyKind`.
fn is_known_status(status: &str) -> bool {
    if status == STR_TRUE || status == STR_UNKNOWN {
        return true;
    }
    parse_false_status(status).is_some()
}

fn parse_false_status(status: &str) -> Option<PropertyKind> {
    let inner = status.strip_prefix("false(")?.strip_suffix(')')?;
    kind_from_str(inner)
}

fn kind_from_str(s: &str) -> Option<PropertyKind> {
    match s {
        "reach" => Some(PropertyKind::Reach),
        "termination" => Some(PropertyKind::Termination),
        "valid-deref" => Some(PropertyKind::ValidDeref),
        "valid-free" => Some(PropertyKind::ValidFree),
        "valid-memtrack" => Some(PropertyKind::ValidMemtrack),
        _ => None,
    }
}

/// Given (status, task file name, property-file content), returns the
/// category. `property_file_content` is `None` when no property file
/// was supplied at all (category `missing`), exactly spec §4.8 step 1.
pub fn get_result_category(
    status: &str,
    task_file_name: &str,
    property_file_content: Option<&str>,
) -> ResultCategory {
    if status == STR_UNKNOWN {
        return ResultCategory::Unknown;
    }
    if !is_known_status(status) {
        return ResultCategory::Error;
    }

    let Some(property_file_content) = property_file_content else {
        return ResultCategory::Missing;
    };

    let file_markers = markers_of_filename(task_file_name);
    let property_kinds = kinds_of_property_file_content(property_file_content);

    let searched: Vec<FileMarker> = file_markers
        .into_iter()
        .filter(|m| property_kinds.contains(&m.kind))
        .collect();

    if searched.is_empty() {
        return ResultCategory::Unknown;
    }

    if status == STR_TRUE {
        if searched.iter().all(|m| m.expected_true) {
            ResultCategory::Correct
        } else {
            ResultCategory::Wrong
        }
    } else {
        // status must be a "false(<kind>)" form, checked by is_known_status.
        let reported_kind = parse_false_status(status).expect("checked by is_known_status");
        let matches = searched
            .iter()
            .any(|m| !m.expected_true && m.kind == reported_kind);
        if matches {
            ResultCategory::Correct
        } else {
            ResultCategory::Wrong
        }
    }
}

/// Score values taken from the SV-COMP scoring scheme (spec §4.8).
pub fn calculate_score(category: ResultCategory, status: &str) -> i32 {
    match category {
        ResultCategory::Correct => {
            if status == STR_TRUE {
                2
            } else {
                1
            }
        }
        ResultCategory::Wrong => {
            if status == STR_TRUE {
                -8
            } else {
                -4
            }
        }
        ResultCategory::Unknown | ResultCategory::Error | ResultCategory::Missing => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_missing_without_property_file() {
        // spec §8: getResultCategory(file, status, None) == missing
        // for every (file, status).
        assert_eq!(
            get_result_category("true", "a_true-unreach-call.c", None),
            ResultCategory::Missing
        );
        assert_eq!(get_result_category("false(reach)", "anything", None), ResultCategory::Missing);
    }

    #[test]
    fn t_scenario_1_single_safe_file() {
        let category = get_result_category(
            "true",
            "a_true-unreach-call.c",
            Some("CHECK( init(main()), LTL(G ! call(__VERIFIER_error())) )"),
        );
        assert_eq!(category, ResultCategory::Correct);
        assert_eq!(calculate_score(category, "true"), 2);
    }

    #[test]
    fn t_scenario_2_wrong_answer_on_reach() {
        let category = get_result_category(
            "false(reach)",
            "a_true-unreach-call.c",
            Some("CHECK( init(main()), LTL(G ! call(__VERIFIER_error())) )"),
        );
        assert_eq!(category, ResultCategory::Wrong);
        assert_eq!(calculate_score(category, "false(reach)"), -4);
    }

    #[test]
    fn t_unknown_status_category_unknown() {
        assert_eq!(
            get_result_category("unknown", "a_true-unreach-call.c", Some("LTL(G ! call(__VERIFIER_error()))")),
            ResultCategory::Unknown
        );
    }

    #[test]
    fn t_garbage_status_is_error() {
        assert_eq!(
            get_result_category("segfault", "a_true-unreach-call.c", Some("LTL(G ! call(__VERIFIER_error()))")),
            ResultCategory::Error
        );
    }

    #[test]
    fn t_no_intersection_is_unknown() {
        // property asks about termination, file only hints at reach.
        assert_eq!(
            get_result_category("true", "a_true-unreach-call.c", Some("LTL(F end)")),
            ResultCategory::Unknown
        );
    }

    #[test]
    fn t_score_is_pure_function_of_inputs() {
        // spec §8: calculateScore depends only on its inputs.
        for _ in 0..3 {
            assert_eq!(calculate_score(ResultCategory::Correct, "true"), 2);
        }
    }
}
