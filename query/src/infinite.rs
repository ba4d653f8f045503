//! Paginated queries: data is a list of pages plus the cursor each page was
//! fetched with.

use std::sync::Arc;

use futures_util::FutureExt;

use crate::error::{Error, Result};
use crate::query::{default_attempt, FetchContext, FetchDirection, QueryBehavior, QueryFn, QueryOptions};
use crate::retryer::Attempt;
use crate::value::Value;

const PAGES: &str = "pages";
const PAGE_PARAMS: &str = "pageParams";

/// The stored shape of an infinite query: `{"pages": [...], "pageParams": [...]}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfiniteData {
  pub pages: Vec<Value>,
  pub page_params: Vec<Value>,
}

impl InfiniteData {
  pub fn from_value(value: &Value) -> Result<Self> {
    let list = |field: &str| {
      value
        .get(field)
        .and_then(Value::as_array)
        .map(<[Value]>::to_vec)
        .ok_or_else(|| Error::Conversion(format!("infinite data is missing `{field}`")))
    };
    Ok(Self {
      pages: list(PAGES)?,
      page_params: list(PAGE_PARAMS)?,
    })
  }

  pub fn into_value(self) -> Value {
    Value::object([
      (PAGES, Value::array(self.pages)),
      (PAGE_PARAMS, Value::array(self.page_params)),
    ])
  }
}

/// Cursor of the page after the last one, if there is one.
pub(crate) fn next_page_param(options: &QueryOptions, data: &InfiniteData) -> Option<Value> {
  let f = options.get_next_page_param.as_ref()?;
  let page = data.pages.last()?;
  let param = data.page_params.last().cloned().unwrap_or_default();
  f(page, &data.pages, &param, &data.page_params).filter(has_page)
}

/// Cursor of the page before the first one, if there is one.
pub(crate) fn previous_page_param(options: &QueryOptions, data: &InfiniteData) -> Option<Value> {
  let f = options.get_previous_page_param.as_ref()?;
  let page = data.pages.first()?;
  let param = data.page_params.first().cloned().unwrap_or_default();
  f(page, &data.pages, &param, &data.page_params).filter(has_page)
}

pub(crate) fn has_next_page(options: &QueryOptions, data: &InfiniteData) -> bool {
  next_page_param(options, data).is_some()
}

pub(crate) fn has_previous_page(options: &QueryOptions, data: &InfiniteData) -> bool {
  previous_page_param(options, data).is_some()
}

// `null` and `false` cursors mean "no such page".
fn has_page(param: &Value) -> bool {
  !param.is_null() && param.as_bool() != Some(false)
}

fn param_arg(param: &Value) -> Option<Value> {
  (!param.is_null()).then(|| param.clone())
}

/// Fetches pages instead of a single value.
pub(crate) struct InfiniteQueryBehavior;

impl QueryBehavior for InfiniteQueryBehavior {
  fn attempt(&self, context: FetchContext) -> Attempt<Value> {
    let Some(query_fn) = context.options.query_fn.clone() else {
      return default_attempt(context);
    };
    let context = Arc::new(context);
    Arc::new(move || fetch_pages(context.clone(), query_fn.clone()).boxed())
  }
}

async fn fetch_pages(context: Arc<FetchContext>, query_fn: QueryFn) -> Result<Value> {
  let options = &context.options;
  let meta = &context.fetch_options.meta;
  let old = context
    .state
    .data
    .as_ref()
    .and_then(|data| InfiniteData::from_value(data).ok())
    .unwrap_or_default();
  let fetch_page = |param: &Value| query_fn(context.function_context(param_arg(param)));

  if old.pages.is_empty() {
    let param = options.initial_page_param.clone().unwrap_or_default();
    let page = fetch_page(&param).await?;
    return Ok(
      InfiniteData {
        pages: vec![page],
        page_params: vec![param],
      }
      .into_value(),
    );
  }

  if let Some(more) = &meta.fetch_more {
    let param = match (&more.page_param, more.direction) {
      (Some(param), _) => Some(param.clone()),
      (None, FetchDirection::Forward) => next_page_param(options, &old),
      (None, FetchDirection::Backward) => previous_page_param(options, &old),
    };
    let Some(param) = param else {
      return Ok(old.into_value());
    };
    let page = fetch_page(&param).await?;
    let mut data = old;
    match more.direction {
      FetchDirection::Forward => {
        data.pages.push(page);
        data.page_params.push(param);
      }
      FetchDirection::Backward => {
        data.pages.insert(0, page);
        data.page_params.insert(0, param);
      }
    }
    return Ok(data.into_value());
  }

  // Refetch: every page in order, each with its recorded cursor unless
  // cursors are rebuilt from the pages fetched so far.
  let rebuild = meta.rebuild_page_params && options.get_next_page_param.is_some();
  let mut data = InfiniteData::default();
  for (index, old_page) in old.pages.iter().enumerate() {
    let param = if index > 0 && rebuild {
      next_page_param(options, &data)
    } else {
      Some(old.page_params.get(index).cloned().unwrap_or_default())
    };
    let Some(param) = param else {
      break;
    };
    let refetch = meta
      .refetch_page
      .as_ref()
      .map_or(true, |f| f(old_page, index, &old.pages));
    let page = if refetch {
      fetch_page(&param).await?
    } else {
      old_page.clone()
    };
    data.pages.push(page);
    data.page_params.push(param);
  }
  Ok(data.into_value())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pages(values: &[i64]) -> InfiniteData {
    InfiniteData {
      pages: values.iter().map(|v| Value::from(*v * 10)).collect(),
      page_params: values.iter().map(|v| Value::from(*v)).collect(),
    }
  }

  fn next_param(_: &Value, _: &[Value], param: &Value, _: &[Value]) -> Option<Value> {
    param.as_i64().filter(|p| *p < 2).map(|p| Value::from(p + 1))
  }

  #[test]
  fn value_shape() {
    let data = pages(&[0, 1]);
    let value = data.clone().into_value();
    assert_eq!(value.get("pageParams").and_then(Value::as_array).map(<[Value]>::len), Some(2));
    assert_eq!(InfiniteData::from_value(&value).ok(), Some(data));
    assert!(InfiniteData::from_value(&Value::from(1)).is_err());
  }

  #[test]
  fn next_page_follows_the_cursor_function() {
    let options = QueryOptions::new("items").get_next_page_param(next_param);
    assert_eq!(next_page_param(&options, &pages(&[0])), Some(Value::from(1)));
    assert!(has_next_page(&options, &pages(&[0, 1])));
    assert!(!has_next_page(&options, &pages(&[0, 1, 2])));
    assert!(!has_next_page(&options, &InfiniteData::default()));
    assert!(!has_previous_page(&options, &pages(&[0])));
  }

  #[test]
  fn false_and_null_cursors_end_the_list() {
    let options = QueryOptions::new("items").get_next_page_param(|_: &Value, _: &[Value], _: &Value, _: &[Value]| {
      Some(Value::from(false))
    });
    assert!(!has_next_page(&options, &pages(&[0])));
    let options = QueryOptions::new("items").get_next_page_param(|_: &Value, _: &[Value], _: &Value, _: &[Value]| {
      Some(Value::Null)
    });
    assert!(!has_next_page(&options, &pages(&[0])));
  }
}
