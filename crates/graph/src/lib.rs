#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod dag;
pub use dag::{Dag, DagId, Dfs};
