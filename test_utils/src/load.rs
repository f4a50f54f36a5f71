use ::test_utils::{init_logger, load_cache_from_json};
use std::env;

fn main() {
    init_logger();
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        panic!("Expected 2 arguments: an input path and a rocksdb cache path")
    }
    load_cache_from_json(&args[1], &args[2]).unwrap();
}
