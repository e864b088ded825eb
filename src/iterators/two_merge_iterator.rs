use anyhow::Result;

use super::StorageIterator;

/// Merge of two differently-typed iterators where `a` is the newer
/// source: on equal keys `a` supplies the entry and `b` is advanced
/// past it.
pub struct TwoMergeIterator<A: StorageIterator, B: StorageIterator> {
    a: A,
    b: B,
    choose_a: bool,
}

impl<
        A: 'static + StorageIterator,
        B: 'static + for<'a> StorageIterator<KeyType<'a> = A::KeyType<'a>>,
    > TwoMergeIterator<A, B>
{
    fn choose_a(a: &A, b: &B) -> bool {
        if !a.is_valid() {
            return false;
        }
        if !b.is_valid() {
            return true;
        }
        a.key() < b.key()
    }

    fn skip_b(&mut self) -> Result<()> {
        if self.a.is_valid() {
            while self.b.is_valid() && self.b.key() == self.a.key() {
                self.b.next()?;
            }
        }
        Ok(())
    }

    pub fn create(a: A, b: B) -> Result<Self> {
        let mut iter = Self {
            a,
            b,
            choose_a: false,
        };
        iter.skip_b()?;
        iter.choose_a = Self::choose_a(&iter.a, &iter.b);
        Ok(iter)
    }
}

impl<
        A: 'static + StorageIterator,
        B: 'static + for<'a> StorageIterator<KeyType<'a> = A::KeyType<'a>>,
    > StorageIterator for TwoMergeIterator<A, B>
{
    type KeyType<'a> = A::KeyType<'a>;

    fn key(&self) -> Self::KeyType<'_> {
        if self.choose_a {
            self.a.key()
        } else {
            self.b.key()
        }
    }

    fn value(&self) -> &[u8] {
        if self.choose_a {
            self.a.value()
        } else {
            self.b.value()
        }
    }

    fn is_valid(&self) -> bool {
        if self.choose_a {
            self.a.is_valid()
        } else {
            self.b.is_valid()
        }
    }

    fn next(&mut self) -> Result<()> {
        if self.choose_a {
            self.a.next()?;
        } else {
            self.b.next()?;
        }
        self.skip_b()?;
        self.choose_a = Self::choose_a(&self.a, &self.b);
        Ok(())
    }

    fn num_active_iterators(&self) -> usize {
        self.a.num_active_iterators() + self.b.num_active_iterators()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterators::merge_iterator::MergeIterator;
    use crate::key::KeySlice;
    use crate::mem_table::MemTableIterator;

    #[test]
    fn a_shadows_b_on_equal_keys() {
        let a = MemTableIterator::for_test(vec![(b"b", 2, b"from-a")]);
        let b = MemTableIterator::for_test(vec![(b"a", 1, b"only-b"), (b"b", 2, b"from-b")]);
        let mut iter = TwoMergeIterator::create(a, b).unwrap();

        assert_eq!(iter.key(), KeySlice::from_slice(b"a", 1));
        assert_eq!(iter.value(), b"only-b");
        iter.next().unwrap();
        assert_eq!(iter.key(), KeySlice::from_slice(b"b", 2));
        assert_eq!(iter.value(), b"from-a");
        iter.next().unwrap();
        assert!(!iter.is_valid());
    }

    #[test]
    fn composes_with_merge_iterators() {
        let mem = MergeIterator::create(vec![Box::new(MemTableIterator::for_test(vec![(
            b"k", 9, b"mem",
        )]))]);
        let disk = MergeIterator::create(vec![Box::new(MemTableIterator::for_test(vec![
            (b"j", 1, b"disk-j"),
            (b"k", 9, b"disk-stale"),
        ]))]);
        let mut iter = TwoMergeIterator::create(mem, disk).unwrap();
        let mut seen = Vec::new();
        while iter.is_valid() {
            seen.push((iter.key().key_ref().to_vec(), iter.value().to_vec()));
            iter.next().unwrap();
        }
        assert_eq!(
            seen,
            vec![
                (b"j".to_vec(), b"disk-j".to_vec()),
                (b"k".to_vec(), b"mem".to_vec()),
            ]
        );
    }
}
