mod embedding_record;
pub mod http_gallery_source;
pub mod json_gallery_source;
