use std::marker::PhantomData;

use anyhow::Result;
use tracing::trace;

use super::{Prepare, ReduceHandle};
use crate::{
    engine::{abandon_with, BytePrepare, Engine},
    error::CollectiveError,
    operation::SerializableObject,
    serializer::{Serializer, SLOT_HEADER_SIZE},
};

/// A reusable reducer of objects that must be serialized to cross the wire.
///
/// Every object is framed into a slot of `max_nbytes` bytes, slots are
/// combined pairwise by decoding both sides, calling
/// [`SerializableObject::reduce`], and re-encoding the result into the
/// destination slot. An encoding that does not fit its slot, before or after a
/// combine, fails the call.
///
/// The scratch buffer is kept between calls.
pub struct SerializeReducer<T> {
    handle: ReduceHandle,
    serializer: Serializer,
    buffer: Vec<u8>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SerializableObject> SerializeReducer<T> {
    pub fn new(serializer: Serializer) -> Self {
        let handle = ReduceHandle::new(
            move |src: &[u8], dst: &mut [u8], max_nbytes: usize| {
                combine_slots::<T>(serializer, src, dst, max_nbytes)
            },
            0,
        );

        Self {
            handle,
            serializer,
            buffer: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Reduce `objs` across the group, in place.
    ///
    /// `max_nbytes` bounds the slot of each object, length header included.
    /// A slot budget that cannot hold the objects, or an object whose
    /// encoding outgrows its slot, abandons the call on this rank and fails it
    /// on every other.
    pub async fn allreduce<E: Engine + ?Sized>(
        &mut self,
        engine: &E,
        objs: &mut [T],
        max_nbytes: usize,
        prepare: Option<Prepare<'_, T>>,
    ) -> Result<()> {
        let count = objs.len();
        let total = match slot_buffer_size(max_nbytes, count) {
            Ok(total) => total,
            Err(err) => return Err(abandon_with(engine, err).await),
        };
        self.buffer.clear();
        self.buffer.resize(total, 0);

        let serializer = self.serializer;
        {
            let objs = &mut *objs;
            let stage: BytePrepare<'_> = Box::new(move |bytes: &mut [u8]| {
                if let Some(prepare) = prepare {
                    prepare(&mut *objs);
                }
                for (obj, slot) in objs.iter().zip(bytes.chunks_exact_mut(max_nbytes)) {
                    serializer.to_slot(obj, slot)?;
                }
                Ok(())
            });
            self.handle
                .resized(max_nbytes)
                .allreduce(engine, &mut self.buffer, count, Some(stage))
                .await?;
        }

        for (obj, slot) in objs.iter_mut().zip(self.buffer.chunks_exact(max_nbytes)) {
            *obj = serializer.from_slot(slot)?;
        }

        Ok(())
    }
}

fn slot_buffer_size(max_nbytes: usize, count: usize) -> Result<usize> {
    if max_nbytes <= SLOT_HEADER_SIZE {
        return Err(CollectiveError::SlotTooSmall {
            size: max_nbytes,
            header: SLOT_HEADER_SIZE,
        }
        .into());
    }

    max_nbytes.checked_mul(count).ok_or_else(|| {
        CollectiveError::BufferSize {
            actual: usize::MAX,
            elem_size: max_nbytes,
            count,
        }
        .into()
    })
}

fn combine_slots<T: SerializableObject>(
    serializer: Serializer,
    src: &[u8],
    dst: &mut [u8],
    max_nbytes: usize,
) -> Result<()> {
    if max_nbytes == 0 || src.len() != dst.len() || dst.len() % max_nbytes != 0 {
        return Err(CollectiveError::BufferSize {
            actual: src.len(),
            elem_size: max_nbytes,
            count: dst.len().checked_div(max_nbytes).unwrap_or(0),
        }
        .into());
    }

    for (src, dst) in src.chunks_exact(max_nbytes).zip(dst.chunks_exact_mut(max_nbytes)) {
        let src_obj: T = serializer.from_slot(src)?;
        let mut dst_obj: T = serializer.from_slot(dst)?;
        SerializableObject::reduce(&mut dst_obj, &src_obj, max_nbytes);
        serializer.to_slot(&dst_obj, dst)?;
    }
    trace!(slots = dst.len() / max_nbytes, "combined serialized slots");

    Ok(())
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use serde::{Deserialize, Serialize};
    use tokio::time::timeout;

    use super::*;
    use crate::engine::in_memory::InMemoryGroup;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
    struct Vocabulary {
        total: u64,
        words: Vec<String>,
    }

    impl SerializableObject for Vocabulary {
        fn reduce(&mut self, src: &Self, _max_nbytes: usize) {
            self.total += src.total;
            self.words.extend(src.words.iter().cloned());
            self.words.sort();
            self.words.dedup();
        }
    }

    fn vocabulary(words: &[&str]) -> Vocabulary {
        Vocabulary {
            total: words.len() as u64,
            words: words.iter().map(|w| w.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn single_rank_leaves_objects_unchanged() {
        let group = InMemoryGroup::new(1).unwrap();
        let result = group
            .run(|comm| async move {
                let mut reducer = SerializeReducer::<Vocabulary>::new(comm.serializer());
                let mut objs = vec![vocabulary(&["b", "a"]), Vocabulary::default()];
                reducer.allreduce(comm.engine(), &mut objs, 64, None).await?;
                Ok(objs)
            })
            .await
            .unwrap();

        assert_eq!(
            result,
            vec![vec![vocabulary(&["b", "a"]), Vocabulary::default()]]
        );
    }

    #[tokio::test]
    async fn merges_objects_across_ranks() {
        let group = InMemoryGroup::new(3).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = group
            .run(move |comm| {
                let counter = counter.clone();
                async move {
                    let rank = comm.rank();
                    let mut reducer = SerializeReducer::<Vocabulary>::new(comm.serializer());
                    let mut objs = vec![Vocabulary::default()];
                    reducer
                        .allreduce(
                            comm.engine(),
                            &mut objs,
                            128,
                            Some(Box::new(move |objs: &mut [Vocabulary]| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                let words = [["lock", "free"], ["free", "list"], ["skip", "list"]];
                                objs[0] = vocabulary(&words[rank]);
                            })),
                        )
                        .await?;
                    Ok(objs.remove(0))
                }
            })
            .await
            .unwrap();

        let expected = Vocabulary {
            total: 6,
            words: vec!["free", "list", "lock", "skip"]
                .into_iter()
                .map(String::from)
                .collect(),
        };
        assert_eq!(result, vec![expected.clone(), expected.clone(), expected]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reuses_scratch_between_calls() {
        let group = InMemoryGroup::new(2).unwrap();
        let result = group
            .run(|comm| async move {
                let mut reducer = SerializeReducer::<Vocabulary>::new(comm.serializer());
                let mut first = vec![vocabulary(&["x"])];
                reducer.allreduce(comm.engine(), &mut first, 32, None).await?;
                let mut second = vec![vocabulary(&["y"]), vocabulary(&["z"])];
                reducer.allreduce(comm.engine(), &mut second, 48, None).await?;
                Ok((first, second))
            })
            .await
            .unwrap();

        for (first, second) in result {
            assert_eq!(first[0].total, 2);
            assert_eq!(second[0].total, 2);
            assert_eq!(second[1].words, vec!["z".to_string()]);
        }
    }

    #[tokio::test]
    async fn oversized_object_fails_the_call() {
        let group = InMemoryGroup::new(1).unwrap();
        let err = group
            .run(|comm| async move {
                let mut reducer = SerializeReducer::<Vocabulary>::new(comm.serializer());
                let mut objs = vec![vocabulary(&["a-rather-long-word-that-cannot-fit"])];
                reducer.allreduce(comm.engine(), &mut objs, 12, None).await?;
                Ok(objs)
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::EncodeOverflow { budget: 12, .. })
        ));
    }

    #[tokio::test]
    async fn combined_object_outgrowing_its_slot_fails_everywhere() {
        let group = InMemoryGroup::new(2).unwrap();
        let results = group
            .communicators()
            .into_iter()
            .map(|comm| {
                tokio::spawn(async move {
                    let mut reducer = SerializeReducer::<Vocabulary>::new(comm.serializer());
                    let words = [["alpha"], ["omega"]];
                    let mut objs = vec![vocabulary(&words[comm.rank()])];
                    reducer.allreduce(comm.engine(), &mut objs, 16, None).await
                })
            })
            .collect::<Vec<_>>();

        for result in futures::future::join_all(results).await {
            assert!(result.unwrap().is_err());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn object_outgrowing_its_slot_on_one_rank_fails_everywhere() {
        let group = InMemoryGroup::with_serializer(2, Serializer::Postcard).unwrap();
        let results = group
            .communicators()
            .into_iter()
            .map(|comm| {
                tokio::spawn(async move {
                    let mut reducer = SerializeReducer::<Vocabulary>::new(comm.serializer());
                    let mut objs = if comm.rank() == 0 {
                        vec![vocabulary(&["a-rather-long-word-that-cannot-fit"])]
                    } else {
                        vec![vocabulary(&["fits"])]
                    };
                    timeout(
                        Duration::from_secs(5),
                        reducer.allreduce(comm.engine(), &mut objs, 24, None),
                    )
                    .await
                })
            })
            .collect::<Vec<_>>();

        let results = futures::future::join_all(results).await;
        let own = results[0].as_ref().unwrap().as_ref().expect("rank 0 hung");
        assert!(matches!(
            own.as_ref().unwrap_err().downcast_ref::<CollectiveError>(),
            Some(CollectiveError::EncodeOverflow { budget: 24, .. })
        ));
        let other = results[1].as_ref().unwrap().as_ref().expect("rank 1 hung");
        let err = format!("{:#}", other.as_ref().unwrap_err());
        assert!(err.contains("rank 0 abandoned"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn undersized_slot_on_one_rank_fails_everywhere() {
        let group = InMemoryGroup::new(2).unwrap();
        let results = group
            .run(|comm| async move {
                let mut reducer = SerializeReducer::<Vocabulary>::new(comm.serializer());
                let budget = if comm.rank() == 1 { SLOT_HEADER_SIZE } else { 64 };
                let mut objs = vec![Vocabulary::default()];
                let result = timeout(
                    Duration::from_secs(5),
                    reducer.allreduce(comm.engine(), &mut objs, budget, None),
                )
                .await?;
                Ok(result.map_err(|err| format!("{err:#}")))
            })
            .await
            .unwrap();

        assert!(results[0].as_ref().unwrap_err().contains("rank 1 abandoned"));
        assert!(results[1].as_ref().unwrap_err().contains("cannot hold"));
    }

    #[tokio::test]
    async fn slot_without_payload_room_is_rejected() {
        let group = InMemoryGroup::new(1).unwrap();
        let engine = group.engine(0).unwrap();
        let mut reducer = SerializeReducer::<Vocabulary>::new(Serializer::Postcard);
        let mut objs = vec![Vocabulary::default()];
        let err = reducer
            .allreduce(&engine, &mut objs, SLOT_HEADER_SIZE, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::SlotTooSmall { .. })
        ));
    }

    #[test]
    fn malformed_slot_is_rejected() {
        let mut dst = vec![0u8; 16];
        Serializer::Postcard
            .to_slot(&Vocabulary::default(), &mut dst)
            .unwrap();
        let mut src = vec![0u8; 16];
        src[..SLOT_HEADER_SIZE].copy_from_slice(&64u32.to_le_bytes());

        let err = combine_slots::<Vocabulary>(Serializer::Postcard, &src, &mut dst, 16).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::DecodeOverflow { declared: 64, .. })
        ));
    }
}
