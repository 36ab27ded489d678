//! Demonstrates tagging allocations of the host and of a dynamically loaded component,
//! then printing the allocation report and the top users.

use alloc_tag::{AllocProfiler, CodeTag, Component, Config, PageId, alloc_tag};

fn main() {
    let config =
        Config::from_boot_args("quiet max_module_alloc_tags=1000 sysctl.vm.mem_profiling=1")
            .expect("boot arguments are valid");
    let profiler = AllocProfiler::new(&config);

    let settings = alloc_tag!("load_settings");
    profiler.register_builtin([settings]);
    profiler.account_alloc(settings, 640);

    let component = Component::new(
        "netdrv",
        vec![
            CodeTag::owned("drivers/net.rs", 40, "rx_refill"),
            CodeTag::owned("drivers/net.rs", 95, "tx_queue_init"),
        ],
    );
    let loaded = profiler
        .load_component(component)
        .expect("tag arena has room for two tags");

    let rx_refill = loaded.tags().first().expect("component has tags");
    profiler.on_pages_allocated(PageId::new(10), 2, rx_refill);
    profiler.on_pages_split(PageId::new(10), 4);
    profiler.on_pages_freed(PageId::new(13), 0);

    let mut report = String::new();
    profiler
        .allocinfo(0)
        .write_to(&mut report)
        .expect("writing to a String cannot fail");
    print!("{report}");

    println!();
    println!("Top users:");
    for entry in profiler.top_users(2, true) {
        println!("{:>12} {}", entry.bytes(), entry.tag().code());
    }

    profiler.unload_component(loaded.id(), false);
    println!();
    println!(
        "Arena ranges still reserved after unload: {}",
        profiler.arena().snapshot().len()
    );
}
