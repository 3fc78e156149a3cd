use crate::backup::upload::ObjectInfo;
use bon::Builder;
use chrono::{DateTime, Utc};
use getset::CopyGetters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::cmp::Reverse;
use std::fmt::{Debug, Formatter};
use std::time::Duration;
use validator::Validate;

/// How many archives survive a run and how often a new one is uploaded
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Validate, Serialize, Deserialize, Builder, CopyGetters)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct RetentionConfig {
    /// Number of newest archives kept after a successful upload
    #[validate(range(min = 1))]
    #[serde(default)]
    keep: Option<usize>,

    /// Skip the run while the newest archive is younger than this
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    min_interval: Option<Duration>,
}

impl RetentionConfig {
    /// When the next upload is due, given the newest stored archive.
    ///
    /// `None` means an upload is due right away.
    pub fn next_upload_due<R>(
        &self,
        newest: Option<&ItemWithDateTime<R>>,
    ) -> Option<DateTime<Utc>> {
        let interval = chrono::Duration::from_std(self.min_interval?).ok()?;
        newest?.date_time.checked_add_signed(interval)
    }

    /// Returns the items to delete so that only the newest `keep` remain.
    ///
    /// Nothing is deleted when `keep` is unset.
    pub fn get_delete<R, I>(&self, items: I) -> Vec<ItemWithDateTime<R>>
    where
        I: IntoIterator<Item = ItemWithDateTime<R>>,
    {
        let Some(keep) = self.keep else {
            return Vec::new();
        };
        items
            .into_iter()
            .sorted_by_key(|item| Reverse(item.date_time))
            .skip(keep)
            .collect()
    }
}

/// An item paired with the time it was created
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct ItemWithDateTime<R> {
    pub item: R,
    pub date_time: DateTime<Utc>,
}

impl<R> From<(R, DateTime<Utc>)> for ItemWithDateTime<R> {
    fn from(value: (R, DateTime<Utc>)) -> Self {
        Self {
            item: value.0,
            date_time: value.1,
        }
    }
}

impl From<ObjectInfo> for ItemWithDateTime<String> {
    fn from(object: ObjectInfo) -> Self {
        let date_time = object.last_modified();
        Self {
            item: object.key().clone(),
            date_time,
        }
    }
}

impl<R: Debug> Debug for ItemWithDateTime<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} @ {}", self.item, self.date_time)
    }
}

/// Newest item, if any.
pub fn newest<R, I>(items: I) -> Option<ItemWithDateTime<R>>
where
    I: IntoIterator<Item = ItemWithDateTime<R>>,
{
    items.into_iter().max_by_key(|item| item.date_time)
}
