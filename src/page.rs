//! Pagination for read paths

/// A normalised page request: `page` is 1-based, `limit` lies in `1..=max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(page: usize, limit: usize, max_limit: usize) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, max_limit.max(1)),
        }
    }
    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

impl<T> Page<T> {
    /// Slice an already ordered collection.
    pub fn from_ordered(all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len();
        let items = all
            .into_iter()
            .skip(request.offset())
            .take(request.limit)
            .collect();
        Self::from_window(items, request, total)
    }

    /// Wrap a window that was already cut out of `total` items.
    pub fn from_window(items: Vec<T>, request: PageRequest, total: usize) -> Self {
        Self {
            items,
            page: request.page,
            limit: request.limit,
            total,
        }
    }

    pub fn total_pages(&self) -> usize {
        self.total.div_ceil(self.limit)
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_normalised() {
        assert_eq!(PageRequest::new(0, 0, 100), PageRequest { page: 1, limit: 1 });
        assert_eq!(PageRequest::new(3, 500, 100), PageRequest { page: 3, limit: 100 });
        assert_eq!(PageRequest::new(3, 20, 100).offset(), 40);
    }

    #[test]
    fn slices_ordered_items() {
        let page = Page::from_ordered((1..=25).collect::<Vec<_>>(), PageRequest::new(3, 10, 100));

        assert_eq!(page.items, vec![21, 22, 23, 24, 25]);
        assert_eq!(page.total, 25);
        assert_eq!(page.total_pages(), 3);
        assert!(!page.has_next());
    }

    #[test]
    fn page_past_the_end_is_empty() {
        let page = Page::from_ordered(vec![1, 2], PageRequest::new(5, 10, 100));
        assert!(page.items.is_empty());
        assert_eq!(page.total, 2);
    }
}
