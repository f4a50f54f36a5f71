use ::test_utils::{dump_cache_to_json, init_logger};
use std::env;

fn main() {
    init_logger();
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        panic!("Expected 2 arguments: a rocksdb cache and an output path")
    }
    dump_cache_to_json(&args[1], &args[2]).unwrap();
}
