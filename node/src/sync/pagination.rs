use chatsync_messaging::Message;

/// Offset/limit window for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub index: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub index: usize,
    pub messages: Vec<Message>,
    pub exhausted: bool,
}

/// Tracks which fixed-size pages of history have been fetched.
///
/// Pages are contiguous and newest-first. The first short page marks the
/// history as exhausted; requests past that index never reach the remote.
#[derive(Debug, Clone)]
pub struct PaginationController {
    page_size: usize,
    next_page: usize,
    exhausted_at: Option<usize>,
}

impl PaginationController {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            next_page: 0,
            exhausted_at: None,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted_at.is_some()
    }

    /// First page not yet fetched successfully.
    pub fn next_page(&self) -> usize {
        self.next_page
    }

    /// `None` when `index` lies past the exhausted end of history.
    pub fn request(&self, index: usize) -> Option<PageRequest> {
        if matches!(self.exhausted_at, Some(end) if index > end) {
            return None;
        }
        Some(PageRequest {
            index,
            offset: index * self.page_size,
            limit: self.page_size,
        })
    }

    /// Record a successful fetch of page `index`.
    pub fn complete(&mut self, index: usize, messages: Vec<Message>) -> Page {
        if messages.len() < self.page_size {
            let end = self.exhausted_at.map_or(index, |end| end.min(index));
            self.exhausted_at = Some(end);
        }
        self.next_page = self.next_page.max(index + 1);
        Page {
            index,
            messages,
            exhausted: self.is_exhausted(),
        }
    }
}
