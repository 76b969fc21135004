use crate::types::PageRange;

/// Hard ceiling on rows requested per page.
pub const MAX_PAGE_SIZE: u16 = 100;

/// Shape of the next snapshot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequest {
    /// Whole filtered relation in one request.
    Full,
    /// One offset/limit window.
    Range(PageRange),
}

impl PageRequest {
    pub fn offset(&self) -> u64 {
        match self {
            Self::Full => 0,
            Self::Range(range) => range.offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Paged { page_size: u16 },
    Unpaginated,
}

/// Tracks the snapshot position of one view.
///
/// Each page starts at the current collection size, so live inserts and
/// deletes shift the next window with the remote ordering. `total_count >
/// loaded` is the sole authority for whether another page exists; the size of
/// the last batch is never consulted.
#[derive(Debug, Clone)]
pub struct PaginationCursor {
    mode: Mode,
    offset: u64,
    total_count: Option<u64>,
    loaded_once: bool,
    in_flight: bool,
}

impl PaginationCursor {
    /// Offset/limit pagination with a clamped page size.
    pub fn paged(page_size: u16) -> Self {
        Self::with_mode(Mode::Paged {
            page_size: bounded_page_size(page_size),
        })
    }

    /// One full load; later "more" requests are unavailable.
    pub fn unpaginated() -> Self {
        Self::with_mode(Mode::Unpaginated)
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            offset: 0,
            total_count: None,
            loaded_once: false,
            in_flight: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn total_count(&self) -> Option<u64> {
        self.total_count
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn page_size(&self) -> Option<u16> {
        match self.mode {
            Mode::Paged { page_size } => Some(page_size),
            Mode::Unpaginated => None,
        }
    }

    /// Whether another page exists given the current collection size.
    pub fn has_more(&self, loaded: usize) -> bool {
        match self.mode {
            Mode::Paged { .. } => self
                .total_count
                .is_some_and(|total| total > loaded as u64),
            Mode::Unpaginated => false,
        }
    }

    /// Reserve the next request, or `None` when one is in flight or nothing remains.
    pub fn next_request(&mut self, loaded: usize) -> Option<PageRequest> {
        if self.in_flight {
            return None;
        }

        let request = match self.mode {
            Mode::Unpaginated => {
                if self.loaded_once {
                    return None;
                }
                PageRequest::Full
            }
            Mode::Paged { page_size } => {
                if self.total_count.is_some() && !self.has_more(loaded) {
                    return None;
                }
                self.offset = loaded as u64;
                PageRequest::Range(PageRange {
                    offset: self.offset,
                    limit: u64::from(page_size),
                })
            }
        };

        self.in_flight = true;
        Some(request)
    }

    /// Record a successful page and the collection size after merging it.
    pub fn complete(&mut self, total_count: Option<u64>, loaded: usize) {
        self.in_flight = false;
        self.loaded_once = true;
        if total_count.is_some() {
            self.total_count = total_count;
        }
        self.offset = loaded as u64;
    }

    /// Release the in-flight reservation after a failed load.
    pub fn fail(&mut self) {
        self.in_flight = false;
    }
}

/// Clamp a requested page size into `1..=MAX_PAGE_SIZE`.
pub fn bounded_page_size(requested: u16) -> u16 {
    requested.clamp(1, MAX_PAGE_SIZE)
}
