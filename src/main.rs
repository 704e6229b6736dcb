use emx86::pc;
use emx86::Emulator;
use std::env;
use std::process::exit;

fn usage() -> ! {
    eprintln!("usage: mypc <image> [--debug] [--load <hex phys addr>] [--lenient]");
    exit(2);
}

fn main() {
    env_logger::init();
    let mut image = None;
    let mut debug = false;
    let mut load_addr = pc::BOOT_SECTOR.1;
    let mut lenient = false;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--debug" => debug = true,
            "--lenient" => lenient = true,
            "--load" => {
                let value = args.next().unwrap_or_else(|| usage());
                let value = value.trim_start_matches("0x");
                load_addr = u64::from_str_radix(value, 16).unwrap_or_else(|_| usage());
            }
            _ if image.is_none() => image = Some(arg),
            _ => usage(),
        }
    }
    let image = image.unwrap_or_else(|| usage());

    let mut config = pc::ibm_pc();
    config.lenient_decode = lenient;
    if load_addr == pc::BOOT_SECTOR.1 {
        config.start = pc::BOOT_SECTOR;
    } else {
        config.start = (0, load_addr);
    }
    let mut em = Emulator::new(config);
    match em.load_image(&image, load_addr) {
        Ok(size) => log::info!("loaded {} ({} bytes) at {:#x}", image, size, load_addr),
        Err(err) => {
            eprintln!("cannot load {}: {}", image, err);
            exit(1);
        }
    }
    em.run(debug);
}
