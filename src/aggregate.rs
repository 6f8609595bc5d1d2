//! Joins the three upstream resources into denormalized [`VideoRecord`]s.
//!
//! The join is deliberately lossy in one direction only: a playlist item with
//! no statistics or comments still produces a record with defaults, so one
//! missing join partner never blocks publishing the rest of the set.

use std::collections::HashMap;

use crate::metadata::{Comment, VideoRecord, embed_url};
use crate::youtube::{PlaylistItem, VideoStats};

/// Merges playlist items with their statistics and comments, keyed by video
/// id. Output preserves the playlist order (reverse-chronological as the
/// upstream returns it); no independent sort is applied.
///
/// Pure: identical inputs always produce identical output.
pub fn aggregate(
    playlist_items: Vec<PlaylistItem>,
    stats_by_id: &HashMap<String, VideoStats>,
    comments_by_id: &HashMap<String, Vec<Comment>>,
) -> Vec<VideoRecord> {
    playlist_items
        .into_iter()
        .map(|item| {
            let stats = stats_by_id.get(&item.video_id).cloned().unwrap_or_default();
            let comments = comments_by_id
                .get(&item.video_id)
                .cloned()
                .unwrap_or_default();
            VideoRecord {
                url: embed_url(&item.video_id),
                id: item.video_id,
                title: item.title,
                published_at: item.published_at,
                view_count: stats.views,
                description: stats.description,
                comments,
            }
        })
        .collect()
}
