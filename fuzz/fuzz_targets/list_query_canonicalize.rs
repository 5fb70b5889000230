#![no_main]

use lens_cache::{canonicalize, ListFilter, ListQuery, ListResource, MAX_PAGE_SIZE};
use lens_core::RepositoryId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let mut lines = raw.lines();
    let resource = match lines.next().and_then(|line| RepositoryId::new(line).ok()) {
        Some(repository) => ListResource::Commits(repository),
        None => ListResource::Repositories,
    };
    let filters = lines.filter_map(ListFilter::parse).collect::<Vec<_>>();
    let page = data.first().copied().map(i64::from).unwrap_or(0) - 64;
    let page_size = data.last().copied().map(i64::from).unwrap_or(0) * 3 - 100;

    let mut forward = ListQuery::new(resource.clone()).page(page).page_size(page_size);
    for filter in &filters {
        forward = forward.filter(filter.field.clone(), filter.value.clone());
    }
    let mut reversed = ListQuery::new(resource)
        .page(page)
        .page_size(page_size)
        .presentation_size(u32::from(data.len() as u8));
    for filter in filters.iter().rev() {
        reversed = reversed.filter(filter.field.clone(), filter.value.clone());
    }

    let key = canonicalize(&forward);
    assert_eq!(key, canonicalize(&reversed));
    assert_eq!(key, canonicalize(&forward));

    let canonical = forward.canonical();
    assert!(canonical.page >= 1);
    assert!((1..=MAX_PAGE_SIZE).contains(&canonical.page_size));
    assert!(canonical.filters.windows(2).all(|pair| pair[0] < pair[1]));

    // Dropping one filter must change the key whenever it changes the canonical filters.
    if let Some((_, rest)) = filters.split_first() {
        let mut narrowed = ListQuery::new(forward.resource.clone())
            .page(page)
            .page_size(page_size);
        for filter in rest {
            narrowed = narrowed.filter(filter.field.clone(), filter.value.clone());
        }
        if narrowed.canonical().filters != canonical.filters {
            assert_ne!(key, canonicalize(&narrowed));
        }
    }
});
