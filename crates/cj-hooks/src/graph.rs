use crate::definitions::HookDefinition;

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Arrange hooks into execution batches.
///
/// Hooks within a batch run in parallel; batches run in order with a barrier
/// between them, which is how readers observe a mutator's writes. Rules:
/// - two hooks sharing a batch must not conflict (mutation overlap or a
///   declared conflict);
/// - when a mutator and a reader conflict, the mutator is placed in an
///   earlier batch (formatters normalize before linters judge);
/// - between two mutators the lower hook id goes first.
///
/// The whole arrangement is a pure function of the input set, tie-broken by
/// hook id, so identical inputs always schedule identically.
pub fn schedule<'a>(hooks: &[&'a HookDefinition]) -> Vec<Vec<&'a HookDefinition>> {
    // Deterministic base order: mutators first, then by id.
    let mut ordered: Vec<&HookDefinition> = hooks.to_vec();
    ordered.sort_by_key(|h| (!h.mutates, h.id));

    let mut batches: Vec<Vec<&HookDefinition>> = Vec::new();
    for hook in ordered {
        // A hook must land strictly after the last batch containing anything
        // it conflicts with.
        let mut earliest = 0;
        for (index, batch) in batches.iter().enumerate() {
            if batch.iter().any(|other| hook.conflicts(other)) {
                earliest = index + 1;
            }
        }
        match batches.get_mut(earliest) {
            Some(batch) => batch.push(hook),
            None => batches.push(vec![hook]),
        }
    }

    for batch in &mut batches {
        batch.sort_by_key(|h| h.id);
    }
    batches
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{by_category, by_id, HookCategory};

    fn batch_index(batches: &[Vec<&HookDefinition>], id: &str) -> usize {
        batches
            .iter()
            .position(|batch| batch.iter().any(|h| h.id == id))
            .unwrap_or_else(|| panic!("{id} not scheduled"))
    }

    #[test]
    fn mutators_precede_readers_of_same_files() {
        let hooks = by_category(HookCategory::Fast);
        let batches = schedule(&hooks);

        let format = batch_index(&batches, "ruff-format");
        let check = batch_index(&batches, "ruff-check");
        assert!(format < check, "formatter must run before linter");
    }

    #[test]
    fn conflicting_mutators_are_serialized() {
        let hooks = by_category(HookCategory::Fast);
        let batches = schedule(&hooks);

        let ws = batch_index(&batches, "trailing-whitespace");
        let eof = batch_index(&batches, "end-of-file-fixer");
        assert_ne!(ws, eof);
        // Lower id first.
        assert!(eof < ws);
    }

    #[test]
    fn independent_readers_share_a_batch() {
        let hooks = by_category(HookCategory::Comprehensive);
        let batches = schedule(&hooks);
        // None of the comprehensive hooks mutate, so one batch suffices.
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), hooks.len());
    }

    #[test]
    fn schedule_is_deterministic() {
        let mut hooks = by_category(HookCategory::Fast);
        let forward = schedule(&hooks);
        hooks.reverse();
        let reversed = schedule(&hooks);

        let flatten = |batches: &[Vec<&HookDefinition>]| -> Vec<Vec<&str>> {
            batches
                .iter()
                .map(|batch| batch.iter().map(|h| h.id).collect())
                .collect()
        };
        assert_eq!(flatten(&forward), flatten(&reversed));
    }

    #[test]
    fn no_batch_contains_a_conflict() {
        let hooks: Vec<&HookDefinition> = by_category(HookCategory::Fast)
            .into_iter()
            .chain(by_category(HookCategory::Comprehensive))
            .collect();
        let batches = schedule(&hooks);
        for batch in &batches {
            for (i, a) in batch.iter().enumerate() {
                for b in &batch[i + 1..] {
                    assert!(!a.conflicts(b), "{} and {} share a batch", a.id, b.id);
                }
            }
        }
    }

    #[test]
    fn empty_input_empty_schedule() {
        let batches = schedule(&[]);
        assert!(batches.is_empty());
    }

    #[test]
    fn single_hook_single_batch() {
        let hook = by_id("ruff-check").unwrap();
        let batches = schedule(&[hook]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].id, "ruff-check");
    }
}
