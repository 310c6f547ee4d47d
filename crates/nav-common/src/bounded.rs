//! Fixed-capacity sorted insertion with eviction

/// Inserts `item` into an already sorted `list` holding at most `cap` entries.
///
/// `precedes(a, b)` is the non-strict ordering (`a` may sit in front of `b`).
/// An item that does not strictly precede the current last entry is appended,
/// or dropped when the list is full. Otherwise it lands before the first entry
/// it precedes and the last entry is evicted if the list overflows. Returns
/// true when the item was kept.
pub fn insert_bounded<T>(
    list: &mut Vec<T>,
    cap: usize,
    item: T,
    precedes: impl Fn(&T, &T) -> bool,
) -> bool {
    if cap == 0 {
        return false;
    }
    let append = match list.last() {
        None => true,
        Some(last) => !precedes(&item, last) || precedes(last, &item),
    };
    if append {
        if list.len() >= cap {
            return false;
        }
        list.push(item);
        return true;
    }
    let slot = list
        .iter()
        .position(|existing| precedes(&item, existing))
        .unwrap_or(list.len());
    list.insert(slot, item);
    list.truncate(cap);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_dist(a: &f32, b: &f32) -> bool {
        a <= b
    }

    #[test]
    fn keeps_ascending_order() {
        let mut list = Vec::new();
        for d in [5.0, 1.0, 3.0, 2.0] {
            insert_bounded(&mut list, 8, d, by_dist);
        }
        assert_eq!(list, vec![1.0, 2.0, 3.0, 5.0]);
    }

    #[test]
    fn full_list_evicts_worst() {
        let mut list = vec![1.0, 2.0, 3.0];
        assert!(insert_bounded(&mut list, 3, 1.5, by_dist));
        assert_eq!(list, vec![1.0, 1.5, 2.0]);

        // Worse than everything in a full list: dropped.
        assert!(!insert_bounded(&mut list, 3, 9.0, by_dist));
        assert_eq!(list, vec![1.0, 1.5, 2.0]);

        // Ties with the last entry queue behind it.
        assert!(!insert_bounded(&mut list, 3, 2.0, by_dist));
        assert_eq!(list, vec![1.0, 1.5, 2.0]);
    }

    #[test]
    fn descending_priority() {
        let mut list: Vec<f32> = Vec::new();
        for t in [0.5, 2.0, 1.0] {
            insert_bounded(&mut list, 2, t, |a, b| a >= b);
        }
        assert_eq!(list, vec![2.0, 1.0]);
    }
}
