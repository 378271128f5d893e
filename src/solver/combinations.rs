//! Brightness-priority combination iterator.
//!
//! Yields k-combinations of a priority-ordered list (brightest star first) so
//! that every combination drawn from the first `m` items comes out before any
//! combination that involves item `m + 1`. A solve that is interrupted early
//! has therefore tried everything the brightest stars can offer.
//!
//! Implementation: co-lexicographic successor over positional indices, which
//! orders combinations by their largest index first. No allocation beyond the
//! current index tuple.

/// Iterator over `k`-combinations of `items` in brightness-prefix order.
#[derive(Debug, Clone)]
pub struct BreadthFirstCombinations {
    items: Vec<usize>,
    /// Current positional indices, strictly increasing; `None` once exhausted.
    current: Option<Vec<usize>>,
}

impl BreadthFirstCombinations {
    /// `items` must already be in priority order. Yields nothing when
    /// `k == 0` or there are fewer than `k` items.
    pub fn new(items: &[usize], k: usize) -> Self {
        let current = (k > 0 && items.len() >= k).then(|| (0..k).collect());
        Self {
            items: items.to_vec(),
            current,
        }
    }
}

impl Iterator for BreadthFirstCombinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let combo = self.current.as_mut()?;
        let out = combo.iter().map(|&i| self.items[i]).collect();

        // Co-lex successor: bump the lowest position that has room below its
        // right neighbour, reset everything to its left to 0, 1, 2, ...
        let k = combo.len();
        let n = self.items.len();
        let mut pos = 0;
        loop {
            let limit = if pos + 1 < k { combo[pos + 1] } else { n };
            if combo[pos] + 1 < limit {
                combo[pos] += 1;
                for (j, slot) in combo.iter_mut().enumerate().take(pos) {
                    *slot = j;
                }
                break;
            }
            pos += 1;
            if pos == k {
                self.current = None;
                break;
            }
        }
        Some(out)
    }
}

/// Binomial coefficient C(n, k).
pub fn n_choose_k(n: usize, k: usize) -> usize {
    if k > n {
        return 0;
    }
    (0..k).fold(1usize, |acc, i| acc * (n - i) / (i + 1))
}
