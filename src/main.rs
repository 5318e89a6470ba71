use comet_mp::{
    gc_state::GcState,
    mutator::Mutator,
    transfer::LoopbackInterconnect,
    Config, Pointer,
};

fn cons(m: &Mutator, value: u64, tail: Pointer) -> Pointer {
    m.push_root(tail);
    let cell = m.allocate(1, 1);
    let tail = m.pop_root();
    unsafe {
        m.write_ref(cell, 0, tail);
        m.write_word(cell, 0, value);
    }
    cell
}

fn sum(m: &Mutator, mut list: Pointer) -> u64 {
    let mut total = 0;
    while !list.is_null() {
        unsafe {
            total += m.read_word(list, 0);
            list = m.read_ref(list, 0);
        }
    }
    total
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config {
        verbose: true,
        summary: true,
        num_procs: 4,
        ..Config::default()
    };
    let gc = GcState::new(config.clone());

    crossbeam_utils::thread::scope(|scope| {
        for proc in 0..config.num_procs {
            let gc = gc.clone();
            scope.spawn(move |_| {
                let m = gc.mutator(proc).unwrap();
                m.push_root(std::ptr::null_mut());
                for i in 0..20_000u64 {
                    let list = cons(&m, i, m.root(0));
                    m.set_root(0, list);
                    if i % 1000 == 0 {
                        // Drop the list now and then so minor collections have garbage.
                        m.set_root(0, std::ptr::null_mut());
                    }
                }
                log::info!("processor {}: list sums to {}", proc, sum(&m, m.root(0)));
            });
        }
    })
    .unwrap();

    let m = gc.mutator(0).unwrap();
    m.collect(0, true);

    let remote = GcState::new(Config {
        verbose: true,
        ..Config::default()
    });
    let receiver = remote.mutator(0).unwrap();
    let nodes = LoopbackInterconnect::network(2);
    let mut list = std::ptr::null_mut();
    for i in 1..=10 {
        list = cons(&m, i, list);
    }
    m.send(&nodes[0], list, 1).unwrap();
    let copy = receiver.recv(&nodes[1], 0).unwrap();
    log::info!("received a list summing to {}", sum(&receiver, copy));
    println!("{}", gc.statistics());
}
