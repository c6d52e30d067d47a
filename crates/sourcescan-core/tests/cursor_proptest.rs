use proptest::prelude::*;
use sourcescan_core::ResumeCursor;

fn id_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,4}"
}

proptest! {
    /// Encoding then decoding is the identity on sorted, deduplicated id lists.
    #[test]
    fn encode_decode_roundtrip(mut ids in prop::collection::vec(id_strategy(), 0..30)) {
        let mut cursor = ResumeCursor::new();
        for id in &ids {
            cursor.insert(id.clone());
        }
        ids.sort();
        ids.dedup();

        let decoded = ResumeCursor::decode(&cursor.encode());
        prop_assert_eq!(decoded, ids);
    }

    /// Applying a cursor to a superset of its entries yields a subset that
    /// includes every id strictly greater than the cursor's max.
    #[test]
    fn filter_resume_keeps_cursor_and_tail(
        all in prop::collection::btree_set(id_strategy(), 1..30),
        cursor_picks in prop::collection::vec(id_strategy(), 0..10),
    ) {
        let all: Vec<String> = all.into_iter().collect();
        let cursor_ids: Vec<String> = cursor_picks
            .into_iter()
            .filter(|id| all.contains(id))
            .collect();

        let mut cursor = ResumeCursor::new();
        for id in &cursor_ids {
            cursor.insert(id.clone());
        }
        let encoded = cursor.encode();

        let (filtered, excluded) = ResumeCursor::filter_resume(&all, &encoded);

        prop_assert!(filtered.len() + excluded == all.len());

        if let Some(max) = cursor_ids.iter().max() {
            for id in &all {
                if id > max {
                    prop_assert!(filtered.contains(id));
                }
            }
            for id in &cursor_ids {
                prop_assert!(filtered.contains(id));
            }
        } else {
            prop_assert_eq!(&filtered, &all);
        }

        // filtered is always a subset of all, in original relative order.
        let mut last_idx = None;
        for id in &filtered {
            let idx = all.iter().position(|x| x == id).unwrap();
            if let Some(last) = last_idx {
                prop_assert!(idx > last);
            }
            last_idx = Some(idx);
        }
    }
}
