#[macro_export]
macro_rules! define_index {
    ($ix:ident, $storage:ident, $elem:ident) => {
        define_index!($ix);

        #[derive(Clone, Debug, Default)]
        #[cfg_attr(
            feature = "enable-serde",
            derive(::serde::Serialize, ::serde::Deserialize)
        )]
        pub struct $storage {
            storage: Vec<$elem>,
        }

        impl $storage {
            #[inline(always)]
            pub fn with_capacity(n: usize) -> Self {
                Self {
                    storage: Vec::with_capacity(n),
                }
            }

            #[inline(always)]
            pub fn len(&self) -> usize {
                self.storage.len()
            }

            #[inline(always)]
            pub fn is_empty(&self) -> bool {
                self.storage.is_empty()
            }

            #[inline(always)]
            pub fn iter(&self) -> impl Iterator<Item = &$elem> {
                self.storage.iter()
            }

            #[inline(always)]
            pub fn push(&mut self, value: $elem) -> $ix {
                let idx = $ix(self.storage.len() as u32);
                self.storage.push(value);
                idx
            }

            #[inline(always)]
            pub fn next_index(&self) -> $ix {
                $ix(self.storage.len() as u32)
            }
        }

        impl core::ops::Index<$ix> for $storage {
            type Output = $elem;

            #[inline(always)]
            fn index(&self, i: $ix) -> &Self::Output {
                &self.storage[i.index()]
            }
        }

        impl<'a> IntoIterator for &'a $storage {
            type Item = &'a $elem;
            type IntoIter = core::slice::Iter<'a, $elem>;

            #[inline(always)]
            fn into_iter(self) -> Self::IntoIter {
                self.storage.iter()
            }
        }
    };

    ($ix:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(
            feature = "enable-serde",
            derive(::serde::Serialize, ::serde::Deserialize)
        )]
        pub struct $ix(pub u32);
        impl $ix {
            #[inline(always)]
            pub fn new(i: usize) -> Self {
                Self(i as u32)
            }
            #[inline(always)]
            pub fn index(self) -> usize {
                debug_assert!(self.is_valid());
                self.0 as usize
            }
            #[inline(always)]
            pub fn invalid() -> Self {
                Self(u32::MAX)
            }
            #[inline(always)]
            pub fn is_invalid(self) -> bool {
                self == Self::invalid()
            }
            #[inline(always)]
            pub fn is_valid(self) -> bool {
                self != Self::invalid()
            }
            #[inline(always)]
            pub fn next(self) -> $ix {
                debug_assert!(self.is_valid());
                Self(self.0 + 1)
            }
            #[inline(always)]
            pub fn prev(self) -> $ix {
                debug_assert!(self.is_valid());
                Self(self.0 - 1)
            }
        }
    };
}

define_index!(Pos);

impl Pos {
    /// A position after every operation of any trace. `free_until_pos`
    /// and `next_real_use` report it when nothing is pinned or used
    /// again.
    pub const INFINITE: Pos = Pos(u32::MAX - 1);
}

impl core::fmt::Display for Pos {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if *self == Pos::INFINITE {
            write!(f, "inf")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

/// An inclusive range of operation positions, used for value
/// lifetimes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct PosRange {
    pub from: Pos,
    pub to: Pos,
}

impl PosRange {
    #[inline(always)]
    pub fn new(from: Pos, to: Pos) -> Self {
        debug_assert!(from <= to);
        PosRange { from, to }
    }

    #[inline(always)]
    pub fn contains(self, pos: Pos) -> bool {
        self.from <= pos && pos <= self.to
    }

    /// Two ranges overlap when one is still live strictly after the
    /// other has been defined. A range that ends exactly where another
    /// starts does not overlap it: the last use and the definition can
    /// share a register.
    #[inline(always)]
    pub fn overlaps(self, other: PosRange) -> bool {
        self.from < other.to && other.from < self.to
    }

    #[inline(always)]
    pub fn len(self) -> usize {
        self.to.index() - self.from.index() + 1
    }

    #[inline(always)]
    pub fn iter(self) -> impl Iterator<Item = Pos> {
        (self.from.0..=self.to.0).map(Pos)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pos_range() {
        let range = PosRange::new(Pos::new(2), Pos::new(5));
        assert_eq!(range.len(), 4);
        assert!(range.contains(Pos::new(2)));
        assert!(range.contains(Pos::new(5)));
        assert!(!range.contains(Pos::new(6)));
        assert_eq!(
            range.iter().collect::<Vec<_>>(),
            vec![Pos::new(2), Pos::new(3), Pos::new(4), Pos::new(5)]
        );
    }

    #[test]
    fn test_pos_range_overlap() {
        let a = PosRange::new(Pos::new(0), Pos::new(5));
        let b = PosRange::new(Pos::new(5), Pos::new(9));
        let c = PosRange::new(Pos::new(4), Pos::new(9));
        assert!(!a.overlaps(b));
        assert!(!b.overlaps(a));
        assert!(a.overlaps(c));
        assert!(c.overlaps(a));
    }

    #[test]
    fn test_infinite_orders_last() {
        assert!(Pos::new(1_000_000) < Pos::INFINITE);
        assert!(Pos::INFINITE < Pos::invalid());
    }
}
