use core_sync::{MemoryStore, ObserverReports, SyncContext, SyncEngine, WorldStore};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use report_schema::{
    Coords, Direction, ExitReport, FactionRef, GameId, RegionReport, Report, StructureKind,
    StructureReport, TemplateUnit, UnitNumber, UnitReport,
};

fn grid_report(size: u16) -> Report {
    let own = FactionRef::new(1, "Bench");
    let rival = FactionRef::new(2, "Rival");
    let mut report = Report::new(own.clone());

    for y in 0..size {
        for x in 0..size {
            let coords = Coords::new(x, y, 1);
            let base = (u32::from(y) * u32::from(size) + u32::from(x)) * 3 + 1;
            let mut region = RegionReport::new(coords, "plain");
            region.population = 1_000 + base;
            region.units.push(UnitReport {
                number: UnitNumber(base),
                name: format!("Unit {base}"),
                faction: Some(own.clone()),
            });
            region.units.push(UnitReport {
                number: UnitNumber(base + 1),
                name: format!("Unit {}", base + 1),
                faction: Some(rival.clone()),
            });
            region.structures.push(StructureReport {
                number: 1,
                name: "Tower".into(),
                kind: StructureKind::Building,
                structure_type: "Tower".into(),
                units: vec![UnitReport {
                    number: UnitNumber(base + 2),
                    name: format!("Unit {}", base + 2),
                    faction: Some(rival.clone()),
                }],
            });
            if x + 1 < size {
                region.exits.push(ExitReport {
                    direction: Direction::Southeast,
                    coords: Coords::new(x + 1, y, 1),
                    terrain: "plain".into(),
                    name: String::new(),
                });
            }
            if y + 1 < size {
                region.exits.push(ExitReport {
                    direction: Direction::South,
                    coords: Coords::new(x, y + 1, 1),
                    terrain: "plain".into(),
                    name: String::new(),
                });
            }
            report.order_template.push(TemplateUnit {
                number: UnitNumber(base),
                orders: "work".into(),
            });
            report.regions.push(region);
        }
    }
    report
}

fn bench_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync");
    let engine = SyncEngine::default();

    for size in [8u16, 16, 32, 64] {
        let report = grid_report(size);

        group.bench_with_input(BenchmarkId::new("fresh", size), &size, |b, _| {
            let store = MemoryStore::new();
            let ctx = SyncContext::new(GameId(1), report.faction.number, 1);
            let seed = engine.seed(&store, ctx).unwrap();
            b.iter_batched(
                || seed.clone(),
                |seed| engine.apply(ctx, seed, &report).unwrap(),
                BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("carry_forward", size), &size, |b, _| {
            let store = MemoryStore::new();
            let first = SyncContext::new(GameId(1), report.faction.number, 1);
            engine
                .sync(&store, first, ObserverReports::own(report.clone()))
                .unwrap();
            let ctx = SyncContext::new(GameId(1), report.faction.number, 2);
            let seed = engine.seed(&store, ctx).unwrap();
            b.iter_batched(
                || seed.clone(),
                |seed| engine.apply(ctx, seed, &report).unwrap(),
                BatchSize::SmallInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("commit", size), &size, |b, _| {
            b.iter_batched(
                MemoryStore::new,
                |store| {
                    let ctx = SyncContext::new(GameId(1), report.faction.number, 1);
                    engine
                        .sync(&store, ctx, ObserverReports::own(report.clone()))
                        .unwrap();
                    store.latest_turn(GameId(1), report.faction.number).unwrap()
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(sync_benches, bench_sync);
criterion_main!(sync_benches);
