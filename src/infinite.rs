use std::{
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::QueryError,
    query::{BehaviorInput, FetchContext, FetchDirection, QueryBehavior, QueryFuture},
};

/// Paged data accumulated by an infinite query, stored on the entry as
/// `{"pages": [...], "pageParams": [...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfiniteData {
    /// Fetched pages, oldest first
    pub pages: Vec<Value>,
    /// The cursor each page was fetched with
    pub page_params: Vec<Value>,
}

impl InfiniteData {
    /// Parses the stored representation, if it is one
    #[must_use = "Has no effect other than to parse the value"]
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// The stored representation
    // Pages and params are plain JSON, serialization cannot fail
    #[allow(clippy::unwrap_used)]
    #[must_use = "Has no effect other than to build the value"]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap()
    }
}

type PageParamFn = Rc<dyn Fn(&Value, &InfiniteData) -> Option<Value>>;

/// Page-cursor configuration for an infinite query
pub struct InfiniteQueryOptions {
    /// Cursor for the very first page
    pub initial_page_param: Value,
    /// Derives the next cursor from the last page and everything fetched;
    /// `None` means there are no more pages
    pub get_next_page_param: PageParamFn,
    /// Derives the previous cursor from the first page, for backward fetch
    pub get_previous_page_param: Option<PageParamFn>,
    /// Cap on retained pages; directional fetches drop from the far end
    pub max_pages: Option<usize>,
}

impl Clone for InfiniteQueryOptions {
    fn clone(&self) -> Self {
        Self {
            initial_page_param: self.initial_page_param.clone(),
            get_next_page_param: Rc::clone(&self.get_next_page_param),
            get_previous_page_param: self.get_previous_page_param.as_ref().map(Rc::clone),
            max_pages: self.max_pages,
        }
    }
}

impl Debug for InfiniteQueryOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfiniteQueryOptions")
            .field("initial_page_param", &self.initial_page_param)
            .field("max_pages", &self.max_pages)
            .finish_non_exhaustive()
    }
}

impl InfiniteQueryOptions {
    /// New options with the given first cursor and next-cursor derivation
    #[must_use = "Creating new options has no effect"]
    pub fn new(
        initial_page_param: Value,
        get_next_page_param: impl Fn(&Value, &InfiniteData) -> Option<Value> + 'static,
    ) -> Self {
        Self {
            initial_page_param,
            get_next_page_param: Rc::new(get_next_page_param),
            get_previous_page_param: None,
            max_pages: None,
        }
    }

    /// Sets [`InfiniteQueryOptions::get_previous_page_param`]
    #[must_use = "Builder pattern"]
    pub fn set_get_previous_page_param(
        mut self,
        get_previous_page_param: impl Fn(&Value, &InfiniteData) -> Option<Value> + 'static,
    ) -> Self {
        self.get_previous_page_param = Some(Rc::new(get_previous_page_param));
        self
    }

    /// Sets [`InfiniteQueryOptions::max_pages`]
    #[must_use = "Builder pattern"]
    pub fn set_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }
}

/// Builds the behavior that turns a query into an infinite query
///
/// A directional fetch appends or prepends one page; a plain refetch
/// replays every existing page from the first cursor (at least `pages`
/// pages when given), stopping early once the cursor chain ends.
#[must_use = "Has no effect until attached to query options"]
pub fn infinite_query_behavior(
    options: InfiniteQueryOptions,
    pages: Option<usize>,
) -> Rc<dyn QueryBehavior> {
    Rc::new(InfiniteBehavior { options, pages })
}

struct InfiniteBehavior {
    options: InfiniteQueryOptions,
    pages: Option<usize>,
}

impl QueryBehavior for InfiniteBehavior {
    fn attempt_fn(&self, input: BehaviorInput) -> Box<dyn Fn() -> QueryFuture> {
        let options = self.options.clone();
        let pages = self.pages;

        Box::new(move || {
            let options = options.clone();
            let query_fn = input.query_fn.clone();
            let key = input.key.clone();
            let meta = input.meta.clone();
            let existing = input.data.clone();
            let direction = input.direction;

            Box::pin(async move {
                let fetch_page = |param: Value| {
                    query_fn.call(FetchContext {
                        key: key.clone(),
                        meta: meta.clone(),
                        page_param: Some(Rc::new(param)),
                    })
                };

                let mut data = existing
                    .as_deref()
                    .and_then(InfiniteData::from_value)
                    .unwrap_or_default();

                match direction {
                    Some(FetchDirection::Forward) => {
                        let param = match data.pages.last() {
                            None => Some(options.initial_page_param.clone()),
                            Some(last) => (options.get_next_page_param)(last, &data),
                        };
                        let Some(param) = param else {
                            return Ok(data.to_value());
                        };
                        let page = fetch_page(param.clone()).await?;
                        data.pages.push(page);
                        data.page_params.push(param);
                        if let Some(max_pages) = options.max_pages {
                            while data.pages.len() > max_pages.max(1) {
                                data.pages.remove(0);
                                data.page_params.remove(0);
                            }
                        }
                    }
                    Some(FetchDirection::Backward) => {
                        let Some(get_previous) = options.get_previous_page_param.clone() else {
                            return Err(QueryError::message(
                                "backward fetch without get_previous_page_param",
                            ));
                        };
                        let param = match data.pages.first() {
                            None => Some(options.initial_page_param.clone()),
                            Some(first) => get_previous(first, &data),
                        };
                        let Some(param) = param else {
                            return Ok(data.to_value());
                        };
                        let page = fetch_page(param.clone()).await?;
                        data.pages.insert(0, page);
                        data.page_params.insert(0, param);
                        if let Some(max_pages) = options.max_pages {
                            while data.pages.len() > max_pages.max(1) {
                                data.pages.pop();
                                data.page_params.pop();
                            }
                        }
                    }
                    None => {
                        let remaining = pages.unwrap_or_else(|| data.pages.len()).max(1);
                        let mut fresh = InfiniteData::default();
                        let mut param = Some(
                            data.page_params
                                .first()
                                .cloned()
                                .unwrap_or_else(|| options.initial_page_param.clone()),
                        );

                        while fresh.pages.len() < remaining {
                            let Some(current) = param else { break };
                            let page = fetch_page(current.clone()).await?;
                            fresh.pages.push(page);
                            fresh.page_params.push(current);
                            // Pages and params stay in lockstep, last() is
                            // always present here
                            #[allow(clippy::unwrap_used)]
                            let last = fresh.pages.last().unwrap();
                            param = (options.get_next_page_param)(last, &fresh);
                        }
                        data = fresh;
                    }
                }

                Ok(data.to_value())
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn stored_representation_round_trips() {
        let data = InfiniteData {
            pages: vec![json!([1, 2]), json!([3])],
            page_params: vec![json!(0), json!(1)],
        };
        let value = data.to_value();
        assert_eq!(value["pages"], json!([[1, 2], [3]]));
        assert_eq!(value["pageParams"], json!([0, 1]));
        assert_eq!(InfiniteData::from_value(&value), Some(data));
    }

    #[test]
    fn non_paged_values_do_not_parse() {
        assert_eq!(InfiniteData::from_value(&json!({ "id": 1 })), None);
    }
}
