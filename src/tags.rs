use std::path::Path;

use log::debug;
use lofty::config::WriteOptions;
use lofty::picture::{Picture, PictureType};
use lofty::prelude::*;
use lofty::tag::Tag;

use crate::error::TagError;

/// The metadata carried over from a source file to its transcoded copy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceTags {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub title: Option<String>,
    pub genre: Option<String>,
    pub track: Option<u32>,
    pub track_total: Option<u32>,
    pub disc: Option<u32>,
    pub disc_total: Option<u32>,
    pub cover: Option<Picture>,
}

fn text(value: Option<std::borrow::Cow<'_, str>>) -> Option<String> {
    let value = value?;
    let s = value.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

impl SourceTags {
    /// Reads the primary tag of `path`, or its first tag if it has no primary one.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, TagError> {
        let file = lofty::read_from_path(path.as_ref())?;
        let Some(tag) = file.primary_tag().or_else(|| file.first_tag()) else {
            debug!("No tags in {:?}", path.as_ref());
            return Ok(Self::default());
        };

        let cover = tag
            .pictures()
            .iter()
            .find(|p| p.pic_type() == PictureType::CoverFront)
            .or_else(|| tag.pictures().first())
            .cloned();

        Ok(SourceTags {
            artist: text(tag.artist()),
            album: text(tag.album()),
            album_artist: text(tag.get_string(&ItemKey::AlbumArtist).map(Into::into)),
            title: text(tag.title()),
            genre: text(tag.genre()),
            track: tag.track(),
            track_total: tag.track_total(),
            disc: tag.disk(),
            disc_total: tag.disk_total(),
            cover,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Writes the carried fields into the primary tag of `target`, creating the tag if needed.
    pub fn embed(&self, target: impl AsRef<Path>) -> Result<(), TagError> {
        let target = target.as_ref();
        let mut file = lofty::read_from_path(target)?;

        if file.primary_tag().is_none() {
            let tag_type = file.primary_tag_type();
            file.insert_tag(Tag::new(tag_type));
        }
        let Some(tag) = file.primary_tag_mut() else {
            return Ok(());
        };

        if let Some(v) = &self.artist {
            tag.set_artist(v.clone());
        }
        if let Some(v) = &self.album {
            tag.set_album(v.clone());
        }
        if let Some(v) = &self.album_artist {
            tag.insert_text(ItemKey::AlbumArtist, v.clone());
        }
        if let Some(v) = &self.title {
            tag.set_title(v.clone());
        }
        if let Some(v) = &self.genre {
            tag.set_genre(v.clone());
        }
        if let Some(v) = self.track {
            tag.set_track(v);
        }
        if let Some(v) = self.track_total {
            tag.set_track_total(v);
        }
        if let Some(v) = self.disc {
            tag.set_disk(v);
        }
        if let Some(v) = self.disc_total {
            tag.set_disk_total(v);
        }
        if let Some(cover) = &self.cover {
            tag.remove_picture_type(cover.pic_type());
            tag.push_picture(cover.clone());
        }

        file.save_to_path(target, WriteOptions::default())?;
        debug!("Embedded tags into {:?}", target);
        Ok(())
    }
}

/// Copies artist, album, track, title, genre and cover art from `source` to `target`.
pub fn copy_tags(source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<(), TagError> {
    let tags = SourceTags::read(source)?;
    if tags.is_empty() {
        return Ok(());
    }
    tags.embed(target)
}
