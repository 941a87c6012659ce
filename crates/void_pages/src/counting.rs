//! Counting page source - observes and limits another source

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{round_to_pages, PageError, PageRegion, PageResult, PageSource, SystemPages};

/// Decorator that counts every call into the wrapped source.
///
/// Optionally enforces a byte budget or a cap on the number of successful
/// requests, which makes out-of-memory paths reproducible.
pub struct CountingPages<S = SystemPages> {
    inner: S,
    /// Byte budget across outstanding regions
    budget: Option<usize>,
    /// Maximum number of successful requests over the source's lifetime
    max_requests: Option<usize>,
    requests: AtomicUsize,
    releases: AtomicUsize,
    failures: AtomicUsize,
    outstanding_bytes: AtomicUsize,
}

/// Snapshot of a [`CountingPages`] source
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageCounters {
    pub requests: usize,
    pub releases: usize,
    pub failures: usize,
    pub outstanding_bytes: usize,
}

impl CountingPages<SystemPages> {
    /// Count calls into the operating system
    pub fn system() -> Self {
        Self::new(SystemPages::new())
    }
}

impl<S: PageSource> CountingPages<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            budget: None,
            max_requests: None,
            requests: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            outstanding_bytes: AtomicUsize::new(0),
        }
    }

    /// Refuse requests that would push outstanding bytes past `bytes`
    pub fn with_budget(mut self, bytes: usize) -> Self {
        self.budget = Some(bytes);
        self
    }

    /// Refuse every request after the first `count` successful ones
    pub fn with_max_requests(mut self, count: usize) -> Self {
        self.max_requests = Some(count);
        self
    }

    /// Successful requests so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Acquire)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Acquire)
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> PageCounters {
        PageCounters {
            requests: self.requests(),
            releases: self.releases(),
            failures: self.failures(),
            outstanding_bytes: self.outstanding_bytes(),
        }
    }

    fn refuse(&self, error: PageError) -> PageResult<PageRegion> {
        self.failures.fetch_add(1, Ordering::AcqRel);
        Err(error)
    }
}

impl<S: PageSource> PageSource for CountingPages<S> {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn request_pages(&self, min_size: usize) -> PageResult<PageRegion> {
        if min_size == 0 {
            return self.refuse(PageError::ZeroSize);
        }
        let rounded = match round_to_pages(min_size, self.page_size()) {
            Some(rounded) => rounded,
            None => return self.refuse(PageError::Overflow),
        };

        if let Some(max) = self.max_requests {
            if self.requests() >= max {
                return self.refuse(PageError::Exhausted { requested: rounded });
            }
        }

        if let Some(budget) = self.budget {
            let remaining = budget.saturating_sub(self.outstanding_bytes());
            if rounded > remaining {
                return self.refuse(PageError::BudgetExceeded {
                    requested: rounded,
                    remaining,
                });
            }
        }

        match self.inner.request_pages(rounded) {
            Ok(region) => {
                self.requests.fetch_add(1, Ordering::AcqRel);
                self.outstanding_bytes.fetch_add(region.len(), Ordering::AcqRel);
                Ok(region)
            }
            Err(e) => self.refuse(e),
        }
    }

    fn release_pages(&self, region: PageRegion) {
        self.releases.fetch_add(1, Ordering::AcqRel);
        self.outstanding_bytes.fetch_sub(region.len(), Ordering::AcqRel);
        self.inner.release_pages(region);
    }
}
