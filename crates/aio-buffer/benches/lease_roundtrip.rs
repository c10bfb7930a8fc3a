use aio_buffer::{BufferPagePool, PoolConfig};
use criterion::{Criterion, black_box};
use std::{env, time::Duration};

/// 租约往返基准：租借、写入、读取、归还。
///
/// # 设计背景（Why）
/// - 每次读完成与每个输出分片都会走一次租借/归还，池的热路径直接决定单连接吞吐；
/// - 同时测量碎片化场景，观察首次适配在空闲表变长后的退化程度。
fn bench_lease_roundtrip(c: &mut Criterion) {
    let pool = BufferPagePool::new(PoolConfig::default()).expect("构建内存池失败");

    c.bench_function("lease_roundtrip_2k", |b| {
        b.iter(|| {
            let mut lease = pool.allocate(2048).expect("租借失败");
            lease.put_slice(&[7u8; 1024]).expect("写入失败");
            black_box(lease.readable().len());
            lease.release();
        });
    });

    // 每隔一个租约保留一个，使空闲表呈梳状分布。
    let mut pinned = Vec::new();
    for index in 0..256 {
        let lease = pool.allocate(512).expect("预热租借失败");
        if index % 2 == 0 {
            pinned.push(lease);
        }
    }

    c.bench_function("lease_roundtrip_fragmented", |b| {
        b.iter(|| {
            let lease = pool.allocate(384).expect("租借失败");
            black_box(lease.offset());
        });
    });

    drop(pinned);
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_lease_roundtrip(&mut criterion);
    criterion.final_summary();
}
