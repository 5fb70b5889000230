use lens_api::Page;
use lens_cache::FetchError;

/// What a view should render for one cached read.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewState<T> {
    Loading,
    Empty,
    Ready(T),
    Failed(FetchError),
}

impl<T> ViewState<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ViewState<U> {
        match self {
            Self::Loading => ViewState::Loading,
            Self::Empty => ViewState::Empty,
            Self::Ready(value) => ViewState::Ready(f(value)),
            Self::Failed(error) => ViewState::Failed(error),
        }
    }

    pub fn into_result(self) -> Result<Option<T>, FetchError> {
        match self {
            Self::Ready(value) => Ok(Some(value)),
            Self::Loading | Self::Empty => Ok(None),
            Self::Failed(error) => Err(error),
        }
    }
}

impl<T> From<Result<T, FetchError>> for ViewState<T> {
    fn from(result: Result<T, FetchError>) -> Self {
        match result {
            Ok(value) => Self::Ready(value),
            Err(error) => Self::Failed(error),
        }
    }
}

impl<T> ViewState<Page<T>> {
    /// Like `From<Result<..>>`, but a page without items renders as `Empty`.
    pub fn from_page(result: Result<Page<T>, FetchError>) -> Self {
        match result {
            Ok(page) if page.is_empty() => Self::Empty,
            other => other.into(),
        }
    }
}
