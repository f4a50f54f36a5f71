pub mod gridcache;
