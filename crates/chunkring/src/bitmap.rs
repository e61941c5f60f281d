//! Compressed changed-pages bitmap carried by commit notifications.
//!
//! One bit per page, packed into u64 words. Notifications are advisory and
//! may name a superset of the pages that actually changed, so the only
//! operations that matter are set, union, drain and iterate.

/// Bitmap over page indices of one SMB.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageBitmap {
    words: Vec<u64>,
}

impl PageBitmap {
    /// An empty bitmap sized for `num_pages` pages.
    pub fn with_pages(num_pages: usize) -> PageBitmap {
        PageBitmap {
            words: vec![0; num_pages.div_ceil(64)],
        }
    }

    /// Rebuilds a bitmap from raw words, as received off the wire.
    pub fn from_words(words: Vec<u64>) -> PageBitmap {
        PageBitmap { words }
    }

    /// The raw words, for the wire.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Marks page `page` changed, growing the bitmap if needed.
    pub fn set(&mut self, page: usize) {
        let word = page / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (page % 64);
    }

    /// True if page `page` is marked.
    pub fn get(&self, page: usize) -> bool {
        self.words
            .get(page / 64)
            .is_some_and(|w| w & (1 << (page % 64)) != 0)
    }

    /// Folds `other` into `self`.
    pub fn union(&mut self, other: &PageBitmap) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst |= src;
        }
    }

    /// True if no page is marked.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Takes the current contents, leaving the bitmap empty.
    pub fn drain(&mut self) -> PageBitmap {
        let len = self.words.len();
        let words = std::mem::replace(&mut self.words, vec![0; len]);
        PageBitmap { words }
    }

    /// Marked page indices, ascending.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            (0..64).filter_map(move |bit| (w & (1 << bit) != 0).then_some(wi * 64 + bit))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_iter() {
        let mut bm = PageBitmap::with_pages(4);
        bm.set(0);
        bm.set(3);
        bm.set(130); // beyond the initial sizing; must grow
        assert!(bm.get(0) && bm.get(3) && bm.get(130));
        assert!(!bm.get(1) && !bm.get(64));
        assert_eq!(bm.iter().collect::<Vec<_>>(), vec![0, 3, 130]);
    }

    #[test]
    fn drain_empties() {
        let mut bm = PageBitmap::with_pages(70);
        bm.set(65);
        let drained = bm.drain();
        assert!(bm.is_empty());
        assert_eq!(drained.iter().collect::<Vec<_>>(), vec![65]);
        assert_eq!(drained.words().len(), 2);
    }

    #[test]
    fn union_grows() {
        let mut a = PageBitmap::with_pages(1);
        a.set(0);
        let mut b = PageBitmap::with_pages(100);
        b.set(99);
        a.union(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 99]);
    }

    #[test]
    fn words_round_trip() {
        let mut bm = PageBitmap::with_pages(128);
        bm.set(5);
        bm.set(127);
        let back = PageBitmap::from_words(bm.words().to_vec());
        assert_eq!(back, bm);
    }
}
