//! Feed windowing: fixed-size pages when no anchor is given, otherwise a
//! `next` window after the anchor and a `prev` window before it.

use sqlx::{QueryBuilder, Sqlite};

pub const PAGE_SIZE: usize = 20;

/// Upper bound for a single `next` or `prev` window
pub const MAX_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// 1-indexed page
    Page(u32),
    Anchored { anchor: i64, next: usize, prev: usize },
}

impl Window {
    pub fn new(anchor: Option<i64>, next: u32, prev: u32, page: u32) -> Self {
        match anchor {
            Some(anchor) => Window::Anchored {
                anchor,
                next: (next as usize).min(MAX_WINDOW),
                prev: (prev as usize).min(MAX_WINDOW),
            },
            None => Window::Page(page.max(1)),
        }
    }
}

/// A bounded id range pushed down into SQL for newest-first feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSlice {
    Page { limit: i64, offset: i64 },
    After { anchor: i64, limit: i64 },
    Before { anchor: i64, limit: i64 },
}

impl IdSlice {
    pub fn page(page: u32) -> Self {
        let size = PAGE_SIZE as i64;
        IdSlice::Page {
            limit: size,
            offset: (i64::from(page.max(1)) - 1) * size,
        }
    }

    /// Append the cursor condition, ordering and limit. Expects the builder
    /// to already hold a WHERE clause.
    pub fn push_bounds(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        match *self {
            IdSlice::Page { limit, offset } => {
                builder.push(" ORDER BY a.id DESC LIMIT ");
                builder.push_bind(limit);
                builder.push(" OFFSET ");
                builder.push_bind(offset);
            }
            IdSlice::After { anchor, limit } => {
                builder.push(" AND a.id > ");
                builder.push_bind(anchor);
                builder.push(" ORDER BY a.id ASC LIMIT ");
                builder.push_bind(limit);
            }
            IdSlice::Before { anchor, limit } => {
                builder.push(" AND a.id < ");
                builder.push_bind(anchor);
                builder.push(" ORDER BY a.id DESC LIMIT ");
                builder.push_bind(limit);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Windows<T> {
    pub next: Vec<T>,
    pub prev: Vec<T>,
}

impl<T: Clone> Windows<T> {
    /// Same contents in both slots
    pub fn both(items: Vec<T>) -> Self {
        Self {
            next: items.clone(),
            prev: items,
        }
    }

    /// Combine the requested windows. A missing side mirrors the other one;
    /// when neither was requested both are empty.
    pub fn mirrored(next: Option<Vec<T>>, prev: Option<Vec<T>>) -> Self {
        match (next, prev) {
            (Some(next), Some(prev)) => Self { next, prev },
            (Some(next), None) => Self::both(next),
            (None, Some(prev)) => Self {
                next: prev.clone(),
                prev,
            },
            (None, None) => Self {
                next: Vec::new(),
                prev: Vec::new(),
            },
        }
    }
}

/// Window an already ranked sequence by position instead of id comparison.
/// An anchor that is not in the ranking sits before the first item.
pub fn window_ranked(ranked: &[i64], window: Window) -> Windows<i64> {
    match window {
        Window::Page(page) => {
            let start = (page.max(1) as usize - 1).saturating_mul(PAGE_SIZE);
            let items = ranked.iter().skip(start).take(PAGE_SIZE).copied().collect();
            Windows::both(items)
        }
        Window::Anchored { anchor, next, prev } => {
            let position = ranked.iter().position(|&id| id == anchor);
            let after = position.map_or(0, |p| p + 1);
            let before = position.unwrap_or(0);

            let next_items = (next > 0)
                .then(|| ranked.iter().skip(after).take(next).copied().collect());
            let prev_items = (prev > 0)
                .then(|| ranked[..before].iter().rev().take(prev).copied().collect());
            Windows::mirrored(next_items, prev_items)
        }
    }
}
