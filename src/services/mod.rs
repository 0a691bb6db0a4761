//! Service layer: the image save/delete lifecycle and the thumbnailer it
//! drives.

pub mod image_service;
pub mod thumbnails;
