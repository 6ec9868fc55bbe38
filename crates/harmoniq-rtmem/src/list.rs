//! Doubly-linked lists whose nodes come from a pluggable allocator.
//!
//! The list logic is written once in [`List`]; where node storage comes from
//! is a compile-time strategy ([`NodeAllocator`]):
//!
//! * [`HeapAlloc`]: the global heap. Non-realtime bookkeeping ([`HeapList`]).
//! * [`SharedPoolAlloc`]: a [`SharedRtMemPool`] that several lists may share,
//!   which is what makes O(1) splicing between them possible ([`RtList`]).
//! * [`LocalPoolAlloc`]: an exclusively owned [`RtMemPool`], no locking at all
//!   ([`LocalRtList`]).
//!
//! Pool-backed lists never call the system allocator from [`List::append`],
//! [`List::insert`] or the removal paths; exhaustion is reported by handing
//! the value back.

use std::alloc::Layout;
use std::fmt;
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use crate::error::PoolError;
use crate::pool::{PoolStats, RawChunk, RtMemPool, SharedRtMemPool};

type Link<T> = Option<NonNull<Node<T>>>;

/// One list entry: sibling links, the allocator's tag and the value.
pub struct Node<T> {
    prev: Link<T>,
    next: Link<T>,
    tag: u32,
    value: T,
}

impl<T> Node<T> {
    /// Layout a pool chunk must satisfy to hold one node.
    pub fn layout() -> Layout {
        Layout::new::<Node<T>>()
    }

    /// Stores the allocator tag of a freshly allocated, uninitialised node.
    ///
    /// # Safety
    /// `node` must point to storage valid for writes of a `Node<T>`.
    #[inline]
    pub unsafe fn write_tag(node: NonNull<Node<T>>, tag: u32) {
        ptr::addr_of_mut!((*node.as_ptr()).tag).write(tag);
    }

    /// Reads the allocator tag written by [`Node::write_tag`].
    ///
    /// # Safety
    /// `node` must have been tagged and not yet deallocated.
    #[inline]
    pub unsafe fn read_tag(node: NonNull<Node<T>>) -> u32 {
        ptr::addr_of!((*node.as_ptr()).tag).read()
    }

    unsafe fn from_chunk(chunk: RawChunk) -> NonNull<Node<T>> {
        let node = chunk.as_non_null().cast::<Node<T>>();
        Node::write_tag(node, chunk.index());
        node
    }

    unsafe fn into_chunk(node: NonNull<Node<T>>) -> RawChunk {
        RawChunk::from_raw_parts(Node::read_tag(node), node.cast())
    }
}

/// Source of node storage for a [`List`].
///
/// # Safety
/// `allocate`/`allocate_sleepy` must return storage that is valid for
/// writes of a `Node<T>` and stays valid until it is passed to
/// `deallocate`. Allocators that report `shares_storage_with` must accept
/// each other's nodes.
pub unsafe trait NodeAllocator<T> {
    /// Realtime path: must not block or call the system allocator for
    /// pool-backed strategies.
    fn allocate(&mut self) -> Option<NonNull<Node<T>>>;

    /// Non-realtime path that may grow the backing storage.
    fn allocate_sleepy(&mut self) -> Option<NonNull<Node<T>>> {
        self.allocate()
    }

    /// # Safety
    /// `node` must come from this allocator (or one sharing its storage) and
    /// its value must already be dropped or moved out.
    unsafe fn deallocate(&mut self, node: NonNull<Node<T>>);

    /// Whether nodes from `other` may be released through `self`.
    fn shares_storage_with(&self, other: &Self) -> bool;
}

/// Node storage from the global heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAlloc;

unsafe impl<T> NodeAllocator<T> for HeapAlloc {
    fn allocate(&mut self) -> Option<NonNull<Node<T>>> {
        let node: Box<MaybeUninit<Node<T>>> = Box::new(MaybeUninit::uninit());
        Some(NonNull::from(Box::leak(node)).cast())
    }

    unsafe fn deallocate(&mut self, node: NonNull<Node<T>>) {
        drop(Box::from_raw(node.as_ptr().cast::<MaybeUninit<Node<T>>>()));
    }

    fn shares_storage_with(&self, _other: &Self) -> bool {
        true
    }
}

fn check_layout<T>(pool: Layout) -> Result<(), PoolError> {
    let node = Node::<T>::layout();
    if pool.size() < node.size() || pool.align() < node.align() {
        return Err(PoolError::LayoutMismatch { chunk: pool, node });
    }
    Ok(())
}

/// Node storage from a pool shared with other lists.
pub struct SharedPoolAlloc<T> {
    pool: SharedRtMemPool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SharedPoolAlloc<T> {
    pub fn new(pool: SharedRtMemPool) -> Result<Self, PoolError> {
        check_layout::<T>(pool.layout())?;
        Ok(Self {
            pool,
            _marker: PhantomData,
        })
    }

    pub fn pool(&self) -> &SharedRtMemPool {
        &self.pool
    }
}

impl<T> Clone for SharedPoolAlloc<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _marker: PhantomData,
        }
    }
}

unsafe impl<T> NodeAllocator<T> for SharedPoolAlloc<T> {
    #[inline]
    fn allocate(&mut self) -> Option<NonNull<Node<T>>> {
        let chunk = self.pool.allocate_atomic()?;
        // SAFETY: the chunk layout was checked against `Node<T>` in `new`.
        Some(unsafe { Node::from_chunk(chunk) })
    }

    fn allocate_sleepy(&mut self) -> Option<NonNull<Node<T>>> {
        let chunk = self.pool.allocate_sleepy()?;
        Some(unsafe { Node::from_chunk(chunk) })
    }

    #[inline]
    unsafe fn deallocate(&mut self, node: NonNull<Node<T>>) {
        self.pool.deallocate(Node::into_chunk(node));
    }

    fn shares_storage_with(&self, other: &Self) -> bool {
        self.pool.ptr_eq(&other.pool)
    }
}

/// Node storage from a pool owned by a single list.
pub struct LocalPoolAlloc<T> {
    pool: RtMemPool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> LocalPoolAlloc<T> {
    pub fn new(pool: RtMemPool) -> Result<Self, PoolError> {
        check_layout::<T>(pool.layout())?;
        Ok(Self {
            pool,
            _marker: PhantomData,
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

unsafe impl<T> NodeAllocator<T> for LocalPoolAlloc<T> {
    #[inline]
    fn allocate(&mut self) -> Option<NonNull<Node<T>>> {
        let chunk = self.pool.allocate_atomic()?;
        Some(unsafe { Node::from_chunk(chunk) })
    }

    fn allocate_sleepy(&mut self) -> Option<NonNull<Node<T>>> {
        let chunk = self.pool.allocate_sleepy()?;
        Some(unsafe { Node::from_chunk(chunk) })
    }

    #[inline]
    unsafe fn deallocate(&mut self, node: NonNull<Node<T>>) {
        self.pool.deallocate(Node::into_chunk(node));
    }

    fn shares_storage_with(&self, _other: &Self) -> bool {
        false
    }
}

/// Non-realtime list on the heap.
pub type HeapList<T> = List<T, HeapAlloc>;
/// Realtime list whose nodes come from a shareable pool.
pub type RtList<T> = List<T, SharedPoolAlloc<T>>;
/// Realtime list with a private, unlocked pool.
pub type LocalRtList<T> = List<T, LocalPoolAlloc<T>>;

/// Doubly-linked list of `T` with nodes from `A`.
pub struct List<T, A: NodeAllocator<T>> {
    head: Link<T>,
    tail: Link<T>,
    len: usize,
    alloc: A,
    _marker: PhantomData<Box<Node<T>>>,
}

// SAFETY: the list owns its nodes; moving it moves ownership of every `T`.
unsafe impl<T: Send, A: NodeAllocator<T> + Send> Send for List<T, A> {}
unsafe impl<T: Sync, A: NodeAllocator<T> + Sync> Sync for List<T, A> {}

impl<T> List<T, HeapAlloc> {
    pub fn new() -> Self {
        Self::new_in(HeapAlloc)
    }
}

impl<T> Default for List<T, HeapAlloc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> List<T, SharedPoolAlloc<T>> {
    /// Creates a pool sized for this list's nodes.
    pub fn create_pool(
        name: &str,
        min_preallocated: usize,
        max_preallocated: usize,
    ) -> Result<SharedRtMemPool, PoolError> {
        SharedRtMemPool::with_layout(name, Node::<T>::layout(), min_preallocated, max_preallocated)
    }

    pub fn new(pool: SharedRtMemPool) -> Result<Self, PoolError> {
        Ok(Self::new_in(SharedPoolAlloc::new(pool)?))
    }

    pub fn pool(&self) -> &SharedRtMemPool {
        self.alloc.pool()
    }
}

impl<T> List<T, LocalPoolAlloc<T>> {
    pub fn with_capacity(
        name: &str,
        min_preallocated: usize,
        max_preallocated: usize,
    ) -> Result<Self, PoolError> {
        let pool =
            RtMemPool::with_layout(name, Node::<T>::layout(), min_preallocated, max_preallocated)?;
        Ok(Self::new_in(LocalPoolAlloc::new(pool)?))
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.alloc.stats()
    }
}

impl<T, A: NodeAllocator<T>> List<T, A> {
    pub fn new_in(alloc: A) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            alloc,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Links `value` at the tail. Hands it back when no node is available.
    #[inline]
    pub fn append(&mut self, value: T) -> Result<(), T> {
        match self.alloc.allocate() {
            Some(node) => {
                unsafe { self.link_new(node, value, true) };
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Links `value` at the head. Hands it back when no node is available.
    #[inline]
    pub fn insert(&mut self, value: T) -> Result<(), T> {
        match self.alloc.allocate() {
            Some(node) => {
                unsafe { self.link_new(node, value, false) };
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Like [`List::append`] but may grow the backing pool. Not realtime safe.
    pub fn append_sleepy(&mut self, value: T) -> Result<(), T> {
        match self.alloc.allocate_sleepy() {
            Some(node) => {
                unsafe { self.link_new(node, value, true) };
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Like [`List::insert`] but may grow the backing pool. Not realtime safe.
    pub fn insert_sleepy(&mut self, value: T) -> Result<(), T> {
        match self.alloc.allocate_sleepy() {
            Some(node) => {
                unsafe { self.link_new(node, value, false) };
                Ok(())
            }
            None => Err(value),
        }
    }

    #[inline]
    pub fn first(&self) -> Option<&T> {
        self.head.map(|node| unsafe { &(*node.as_ptr()).value })
    }

    #[inline]
    pub fn last(&self) -> Option<&T> {
        self.tail.map(|node| unsafe { &(*node.as_ptr()).value })
    }

    pub fn first_mut(&mut self) -> Option<&mut T> {
        self.head.map(|node| unsafe { &mut (*node.as_ptr()).value })
    }

    pub fn last_mut(&mut self) -> Option<&mut T> {
        self.tail.map(|node| unsafe { &mut (*node.as_ptr()).value })
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.node_at(index)
            .map(|node| unsafe { &(*node.as_ptr()).value })
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.node_at(index)
            .map(|node| unsafe { &mut (*node.as_ptr()).value })
    }

    #[inline]
    pub fn pop_first(&mut self) -> Option<T> {
        let node = self.head?;
        Some(unsafe { self.unlink(node) })
    }

    #[inline]
    pub fn pop_last(&mut self) -> Option<T> {
        let node = self.tail?;
        Some(unsafe { self.unlink(node) })
    }

    pub fn remove_at(&mut self, index: usize) -> Option<T> {
        let node = self.node_at(index)?;
        Some(unsafe { self.unlink(node) })
    }

    /// Removes the first entry equal to `value`.
    pub fn remove_one(&mut self, value: &T) -> bool
    where
        T: PartialEq,
    {
        let mut cursor = self.head;
        while let Some(node) = cursor {
            unsafe {
                if (*node.as_ptr()).value == *value {
                    drop(self.unlink(node));
                    return true;
                }
                cursor = (*node.as_ptr()).next;
            }
        }
        false
    }

    /// Removes every entry equal to `value` and returns how many went.
    pub fn remove_all(&mut self, value: &T) -> usize
    where
        T: PartialEq,
    {
        let before = self.len;
        self.retain(|entry| entry != value);
        before - self.len
    }

    /// Keeps only the entries for which `keep` returns `true`.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&T) -> bool,
    {
        let mut cursor = self.head;
        while let Some(node) = cursor {
            unsafe {
                cursor = (*node.as_ptr()).next;
                if !keep(&(*node.as_ptr()).value) {
                    drop(self.unlink(node));
                }
            }
        }
    }

    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.iter().any(|entry| entry == value)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            head: self.head,
            tail: self.tail,
            len: self.len,
            _marker: PhantomData,
        }
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        IterMut {
            head: self.head,
            tail: self.tail,
            len: self.len,
            _marker: PhantomData,
        }
    }

    /// Moves every node of `self` to the tail of `target` without touching
    /// the allocator. `self` ends up empty.
    ///
    /// Returns `false`, leaving both lists alone, when the two lists do not
    /// share node storage.
    pub fn splice_append(&mut self, target: &mut Self) -> bool {
        self.move_to(target, true)
    }

    /// Moves every node of `self` to the head of `target`; see
    /// [`List::splice_append`].
    pub fn splice_insert(&mut self, target: &mut Self) -> bool {
        self.move_to(target, false)
    }

    fn move_to(&mut self, target: &mut Self, in_tail: bool) -> bool {
        if !self.alloc.shares_storage_with(&target.alloc) {
            return false;
        }
        let (Some(first), Some(last)) = (self.head, self.tail) else {
            return true;
        };

        unsafe {
            if in_tail {
                (*first.as_ptr()).prev = target.tail;
                match target.tail {
                    Some(tail) => (*tail.as_ptr()).next = Some(first),
                    None => target.head = Some(first),
                }
                target.tail = Some(last);
            } else {
                (*last.as_ptr()).next = target.head;
                match target.head {
                    Some(head) => (*head.as_ptr()).prev = Some(last),
                    None => target.tail = Some(last),
                }
                target.head = Some(first);
            }
        }

        target.len += self.len;
        self.head = None;
        self.tail = None;
        self.len = 0;
        true
    }

    /// Drops every value and returns every node to the allocator.
    pub fn clear(&mut self) {
        while self.pop_first().is_some() {}
    }

    fn node_at(&self, index: usize) -> Link<T> {
        if index >= self.len {
            return None;
        }
        unsafe {
            if index < self.len / 2 {
                let mut node = self.head?;
                for _ in 0..index {
                    node = (*node.as_ptr()).next?;
                }
                Some(node)
            } else {
                let mut node = self.tail?;
                for _ in 0..(self.len - 1 - index) {
                    node = (*node.as_ptr()).prev?;
                }
                Some(node)
            }
        }
    }

    /// # Safety
    /// `node` must be fresh storage from `self.alloc`.
    unsafe fn link_new(&mut self, node: NonNull<Node<T>>, value: T, at_tail: bool) {
        let raw = node.as_ptr();
        ptr::addr_of_mut!((*raw).value).write(value);
        if at_tail {
            ptr::addr_of_mut!((*raw).prev).write(self.tail);
            ptr::addr_of_mut!((*raw).next).write(None);
            match self.tail {
                Some(tail) => (*tail.as_ptr()).next = Some(node),
                None => self.head = Some(node),
            }
            self.tail = Some(node);
        } else {
            ptr::addr_of_mut!((*raw).prev).write(None);
            ptr::addr_of_mut!((*raw).next).write(self.head);
            match self.head {
                Some(head) => (*head.as_ptr()).prev = Some(node),
                None => self.tail = Some(node),
            }
            self.head = Some(node);
        }
        self.len += 1;
    }

    /// # Safety
    /// `node` must be linked into `self`.
    unsafe fn unlink(&mut self, node: NonNull<Node<T>>) -> T {
        let raw = node.as_ptr();
        let prev = (*raw).prev;
        let next = (*raw).next;
        match prev {
            Some(prev) => (*prev.as_ptr()).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => (*next.as_ptr()).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        let value = ptr::addr_of!((*raw).value).read();
        self.alloc.deallocate(node);
        value
    }
}

impl<T, A: NodeAllocator<T>> Drop for List<T, A> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: fmt::Debug, A: NodeAllocator<T>> fmt::Debug for List<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a, T, A: NodeAllocator<T>> IntoIterator for &'a List<T, A> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T, A: NodeAllocator<T>> IntoIterator for &'a mut List<T, A> {
    type Item = &'a mut T;
    type IntoIter = IterMut<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

/// Forward/backward cursor over a [`List`].
pub struct Iter<'a, T> {
    head: Link<T>,
    tail: Link<T>,
    len: usize,
    _marker: PhantomData<&'a T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.len == 0 {
            return None;
        }
        self.head.map(|node| unsafe {
            self.len -= 1;
            self.head = (*node.as_ptr()).next;
            &(*node.as_ptr()).value
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}

impl<T> DoubleEndedIterator for Iter<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.len == 0 {
            return None;
        }
        self.tail.map(|node| unsafe {
            self.len -= 1;
            self.tail = (*node.as_ptr()).prev;
            &(*node.as_ptr()).value
        })
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
impl<T> FusedIterator for Iter<'_, T> {}

/// Mutable cursor over a [`List`].
pub struct IterMut<'a, T> {
    head: Link<T>,
    tail: Link<T>,
    len: usize,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T> Iterator for IterMut<'a, T> {
    type Item = &'a mut T;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.len == 0 {
            return None;
        }
        self.head.map(|node| unsafe {
            self.len -= 1;
            self.head = (*node.as_ptr()).next;
            &mut (*node.as_ptr()).value
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}

impl<T> DoubleEndedIterator for IterMut<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.len == 0 {
            return None;
        }
        self.tail.map(|node| unsafe {
            self.len -= 1;
            self.tail = (*node.as_ptr()).prev;
            &mut (*node.as_ptr()).value
        })
    }
}

impl<T> ExactSizeIterator for IterMut<'_, T> {}
impl<T> FusedIterator for IterMut<'_, T> {}
