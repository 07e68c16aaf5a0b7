//! Combinator behaviour: await_all / await_any and the composites.

use std::rc::Rc;

use weft::{
    async_all, async_any, await_all, await_any, block_on, start_async, AsAwaitable, Awaitable,
    Fault,
};

fn completed(tag: &str) -> Awaitable {
    let awaitable = Awaitable::new(tag);
    awaitable.take_completer().complete();
    awaitable
}

fn failed(tag: &str, message: &str) -> Awaitable {
    let awaitable = Awaitable::new(tag);
    awaitable.take_completer().fail(Fault::msg(message));
    awaitable
}

// ---------------------------------------------------------------------------
// await_all
// ---------------------------------------------------------------------------

#[test]
fn all_of_terminal_elements_resolves_immediately() {
    let items = vec![completed("a"), completed("b"), completed("c")];
    block_on(async { await_all(&items).await }).unwrap();
}

#[test]
fn all_waits_for_every_element() {
    let items = vec![Awaitable::new("a"), Awaitable::new("b")];
    let completers: Vec<_> = items.iter().map(|a| a.take_completer()).collect();

    let result = block_on(async {
        let gather = start_async("gather", async move {
            await_all(&items).await?;
            Ok(())
        });
        for completer in &completers {
            completer.complete();
        }
        gather.wait().await
    });
    result.unwrap();
}

#[test]
fn all_short_circuits_on_first_failure() {
    let items = vec![completed("a"), failed("b", "b broke"), Awaitable::new("c")];
    let failure = block_on(async { await_all(&items).await }).unwrap_err();
    assert_eq!(failure.to_string(), "b broke");
    // Prior completions are not rolled back, and the pending tail is
    // untouched.
    assert!(items[0].did_complete());
    assert!(!items[2].is_done());
}

#[test]
fn all_of_empty_slice_is_trivially_done() {
    let items: Vec<Awaitable> = Vec::new();
    block_on(async { await_all(&items).await }).unwrap();
}

// ---------------------------------------------------------------------------
// await_any
// ---------------------------------------------------------------------------

#[test]
fn any_tie_breaks_by_position() {
    // Both are already done before the call; the first in slice order wins.
    let items = vec![completed("x"), completed("y")];
    let winner = block_on(await_any(&items));
    assert_eq!(winner, Some(0));
}

#[test]
fn any_of_empty_slice_returns_none() {
    let items: Vec<Awaitable> = Vec::new();
    assert_eq!(block_on(await_any(&items)), None);
}

#[test]
fn any_returns_the_element_that_caused_resumption() {
    let result = block_on(async {
        let items = vec![Awaitable::new("slow"), Awaitable::new("fast")];
        let fast = items[1].take_completer();

        let race = start_async("race", async move {
            let winner = await_any(&items).await;
            assert_eq!(winner, Some(1));
            Ok(())
        });

        fast.complete();
        race.wait().await
    });
    result.unwrap();
}

#[test]
fn any_does_not_propagate_failure() {
    let items = vec![Awaitable::new("pending"), failed("bad", "went wrong")];
    let winner = block_on(await_any(&items)).unwrap();
    assert_eq!(winner, 1);
    // The caller decides whether to rethrow.
    let failure = block_on(async { items[winner].wait().await }).unwrap_err();
    assert_eq!(failure.to_string(), "went wrong");
}

#[test]
fn any_deregisters_losers() {
    let result = block_on(async {
        let items = vec![Awaitable::new("a"), Awaitable::new("b")];
        let first = items[0].take_completer();
        let second = items[1].take_completer();

        let race = start_async("race", async move {
            let winner = await_any(&items).await;
            assert_eq!(winner, Some(0));
            // Registration on the loser was cleared: a fresh await works.
            items[1].wait().await?;
            Ok(())
        });

        first.complete();
        second.complete();
        race.wait().await
    });
    result.unwrap();
}

// ---------------------------------------------------------------------------
// Selector shim
// ---------------------------------------------------------------------------

struct Download {
    awaitable: Awaitable,
    #[allow(dead_code)]
    url: &'static str,
}

impl AsAwaitable for Download {
    fn as_awaitable(&self) -> &Awaitable {
        &self.awaitable
    }
}

#[test]
fn selector_projects_user_types_and_pairs() {
    let downloads = vec![
        Download { awaitable: completed("first"), url: "a.example" },
        Download { awaitable: Awaitable::new("second"), url: "b.example" },
    ];
    assert_eq!(block_on(await_any(&downloads)), Some(0));

    let pairs = vec![(completed("k"), 42u32), (Awaitable::new("l"), 7u32)];
    assert_eq!(block_on(await_any(&pairs)), Some(0));
    block_on(async { pairs[0].0.wait().await }).unwrap();
}

// ---------------------------------------------------------------------------
// Composites
// ---------------------------------------------------------------------------

#[test]
fn async_all_completes_when_all_members_do() {
    let members = vec![Awaitable::new("a"), Awaitable::new("b")];
    let completers: Vec<_> = members.iter().map(|m| m.take_completer()).collect();

    let composite = async_all(members);
    assert!(!composite.is_done());

    block_on(async {
        for completer in &completers {
            completer.complete();
        }
        composite.wait().await
    })
    .unwrap();
}

#[test]
fn async_all_fails_with_first_member_failure() {
    let members = vec![completed("ok"), failed("bad", "member broke")];
    let composite = async_all(members);
    let failure = block_on(async { composite.wait().await }).unwrap_err();
    assert_eq!(failure.to_string(), "member broke");
}

#[test]
fn async_any_publishes_winning_position() {
    let members = vec![Awaitable::new("a"), Awaitable::new("b")];
    let second = members[1].take_completer();

    let (composite, winner) = async_any(members);
    assert_eq!(winner.get(), None);

    block_on(async {
        second.complete();
        composite.wait().await
    })
    .unwrap();
    assert_eq!(winner.get(), Some(1));
}

#[test]
fn async_any_of_empty_collection_never_completes() {
    let (composite, winner) = async_any(Vec::new());
    for _ in 0..4 {
        weft::drive_cycle();
    }
    assert!(!composite.is_done());
    assert_eq!(winner.get(), None);
    // Dropping the composite unwinds the parked body.
    drop(composite);
}

#[test]
fn cancelling_a_parked_race_leaves_members_reusable() {
    let members = Rc::new(vec![Awaitable::new("a"), Awaitable::new("b")]);
    let completer = members[0].take_completer();

    let shared = members.clone();
    let race = start_async("race", async move {
        await_any(shared.as_slice()).await;
        Ok(())
    });

    // Cancel the race while it is registered on both members.
    drop(race);

    // Registrations were cleared: completing and awaiting still works.
    let result = block_on(async {
        completer.complete();
        members[0].wait().await
    });
    result.unwrap();
}
